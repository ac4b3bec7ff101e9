use gossipmesh_runtime::Runtime;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub(crate) enum TaskId {
    Receiver,
    Bootstrapper,
    Prober,
    Sweeper,
}

pub(crate) type GossipRuntime = Runtime<TaskId>;
