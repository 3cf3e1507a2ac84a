pub mod config;
pub mod messaging;
pub mod push;
pub mod reply_cache;
pub mod routing;
pub mod servent;
pub mod util;

#[cfg(test)]
pub mod test_util;
