pub mod connection;
pub mod frame_reader;
pub mod function_code;
pub mod guid;
pub mod handshake;
pub mod header;
pub mod message;
pub mod payload;
