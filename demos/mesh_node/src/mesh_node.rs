use std::collections::HashMap;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};

use async_trait::async_trait;
use clap::Parser;
use gossipmesh::{config::GossiperConfigBuilder, Gossiper, MemberEvent, MemberEventsListener, MemberListener, MemberState};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

const BIND_PORT: u16 = 5870;
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

type ListenerError = Box<dyn Error + Send + Sync>;

/// Logs every membership change and, at debug level, every received batch as JSON.
struct EventLogger;

#[async_trait]
impl MemberListener for EventLogger {
    async fn on_member_updated(&self, event: MemberEvent) -> Result<(), ListenerError> {
        info!("{}", event);
        Ok(())
    }
}

#[async_trait]
impl MemberEventsListener for EventLogger {
    async fn on_member_events(&self, events: Vec<MemberEvent>) -> Result<(), ListenerError> {
        debug!("{}", serde_json::to_string(&events)?);
        Ok(())
    }
}

/// Keeps the service endpoints of live members, the way a client-side load
/// balancer would consume membership events.
#[derive(Default)]
struct ServicePool {
    endpoints: Mutex<HashMap<SocketAddrV4, (u8, SocketAddrV4)>>,
}

impl ServicePool {
    fn snapshot(&self) -> Vec<(u8, SocketAddrV4)> {
        self.endpoints.lock().values().copied().collect()
    }
}

#[async_trait]
impl MemberListener for ServicePool {
    async fn on_member_updated(&self, event: MemberEvent) -> Result<(), ListenerError> {
        let mut endpoints = self.endpoints.lock();
        if event.state == MemberState::Alive && event.service_port != 0 {
            let service = SocketAddrV4::new(event.ip, event.service_port);
            endpoints.insert(event.member_endpoint(), (event.service, service));
        } else if event.state != MemberState::Suspicious {
            endpoints.remove(&event.member_endpoint());
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value_t = BIND_PORT)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// Seed member to bootstrap from, may be repeated
    #[arg(long = "seed")]
    seeds: Vec<SocketAddrV4>,

    #[arg(long, default_value_t = 1000)]
    period_ms: u64,

    #[arg(long, default_value_t = 0)]
    service: u8,

    #[arg(long, default_value_t = 0)]
    service_port: u16,
}

fn setup_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_level(true);

    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Waits for the gossiper to report running, failing if its start task ends first.
async fn wait_until_running(gossiper: &Gossiper, handle: &JoinHandle<()>) -> Result<()> {
    while !gossiper.is_running() {
        if handle.is_finished() {
            anyhow::bail!("gossiper stopped before it started running");
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing();

    let pool = Arc::new(ServicePool::default());
    let logger = Arc::new(EventLogger);
    let config = GossiperConfigBuilder::new()
        .with_addr(args.ip)
        .with_port(args.port)
        .with_protocol_period(Duration::from_millis(args.period_ms))
        .with_seeds(args.seeds)
        .with_service(args.service, args.service_port)
        .with_member_listener(logger.clone())
        .with_member_listener(pool.clone())
        .with_member_events_listener(logger)
        .build()
        .await?;

    let gossiper = Gossiper::new(config).await.context("Failed to initialize gossiper")?;
    let handle = {
        let gossiper = gossiper.clone();
        tokio::spawn(async move {
            if let Err(e) = gossiper.start().await {
                error!("[ERR] Error running gossiper: {:?}", e);
            }
        })
    };

    wait_until_running(&gossiper, &handle).await?;
    info!("Local member: {}", gossiper.local_member());

    let mut ticker = time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for member in gossiper.members() {
                    info!("  {}", member);
                }
                info!("Services: {:?}", pool.snapshot());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Signal received, leaving the cluster...");
                gossiper.leave().await?;
                // Give the announcement a period to go out before the socket closes.
                time::sleep(Duration::from_millis(args.period_ms)).await;
                gossiper.stop().await?;
                break;
            }
        }
    }

    handle.await?;
    info!("Node stopped. Goodbye!");
    Ok(())
}
