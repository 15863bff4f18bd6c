pub mod host;
pub mod remote;
pub mod task_monitor;
pub mod tenant;

pub use host::*;
pub use remote::*;
pub use task_monitor::*;
pub use tenant::*;
