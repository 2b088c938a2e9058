//! The hardware layer: the multi-threaded CAN pump, its storage sibling,
//! the plugin contracts they drive, and the bundled plugin implementations.
pub mod events;
pub mod interface;
pub mod plugins;
pub mod storage;
pub mod traits;
