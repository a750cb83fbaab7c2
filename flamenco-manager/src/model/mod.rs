pub mod blacklist;
pub mod task;
pub mod update;
pub mod worker;

pub use blacklist::BlacklistEntry;
pub use task::{Command, SettingValue, Task, TaskStatus};
pub use update::TaskUpdate;
pub use worker::{Worker, WorkerStatus};
