pub mod http;
pub mod listener;
pub mod protocol;
pub mod relay;
pub mod socks5;
