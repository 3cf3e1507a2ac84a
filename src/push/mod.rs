pub mod connector;
pub mod push_coordinator;
pub mod push_state;
pub mod rendezvous_handler;
pub mod rendezvous_protocol;
