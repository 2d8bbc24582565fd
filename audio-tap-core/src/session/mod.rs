pub mod delivery;
pub mod manager;
pub mod permission_gateway;
pub mod pipeline;
pub mod queue;
pub mod topology_monitor;
