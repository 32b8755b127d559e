pub mod device;
pub mod http;
pub mod iot;
pub mod migrate;
pub mod quirks;
pub mod reconcile;
pub mod refresh;
pub mod state;
