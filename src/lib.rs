pub mod alarm;
pub mod bus;
pub mod descriptor;
pub mod event;
pub mod launcher;
pub mod logging;
pub mod names;
pub mod subsystem;
pub mod utils;

pub use crate::bus::{PlatformBus, PlatformEvent};
pub use crate::descriptor::{ProcessDescriptor, SubsystemDescriptor};
pub use crate::subsystem::registry::{SubsystemHandle, SubsystemRegistry};
pub use crate::subsystem::state::{AdminState, OperState, RestartPolicy};
pub use crate::subsystem::{StartedSubsystem, Subsystem};
