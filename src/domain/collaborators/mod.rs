pub mod portal;
pub mod proxy;
pub mod resource_graph;
pub mod rpc;
pub mod scripted;
pub mod site_store;
