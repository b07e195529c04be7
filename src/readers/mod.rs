//! Concrete sensor readers and the groups built from them

pub mod board;
pub mod os;
pub mod power;

pub use board::{hardware_group, CommandRunner, Vcgencmd};
pub use os::{os_group, OsSource, SystemSource};
pub use power::{open_line, power_group, DigitalLine};

/// Group name of operating-system metrics
pub const OS_GROUP: &str = "os_info";

/// Group name of board vitals
pub const HARDWARE_GROUP: &str = "hw_info";

/// Group name of external power presence
pub const POWER_GROUP: &str = "ac_info";
