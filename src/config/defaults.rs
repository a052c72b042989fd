use std::net::{IpAddr, Ipv4Addr};

pub const DEFAULT_PORT: u16 = 19091;
pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_CAPTURE_RATE: u32 = 48_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub(super) const MIN_QUEUE_CAPACITY: usize = 8;
pub(super) const MAX_QUEUE_CAPACITY: usize = 1024;
/// Config files larger than this are rejected before parsing.
pub(super) const MAX_CONFIG_FILE_BYTES: u64 = 64 * 1024;
