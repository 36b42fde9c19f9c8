pub mod block;
pub mod endpoint;
pub mod flow;
pub mod node;
pub mod raw_job;
pub mod site;
pub mod sjob;
pub mod stage;
