pub mod buf_ext;
pub mod byte_order;
pub mod random;
pub mod safe_converter;
pub mod net_addr;
pub mod lines;
