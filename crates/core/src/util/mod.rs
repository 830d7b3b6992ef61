pub mod time_source;

pub use time_source::{RealTime, TimeSource, VirtualTime};
