// A set of helper structs for common operations
//
// Nothing in here may depend on Vulkan types, these helpers are
// shared OS plumbing for the layer proper.
pub mod timing;
#[macro_use]
pub mod logging;
pub mod fdwatch;
pub mod log;
pub mod semaphore;
