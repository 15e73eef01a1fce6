mod addr;

pub use addr::{get_unused_addr, get_unused_udp_addr};
