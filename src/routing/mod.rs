pub mod message_router;
pub mod route_table;
