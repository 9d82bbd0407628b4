pub mod state;
pub mod sync;

pub use state::{ClientState, ThreadView};
pub use sync::{SyncConfig, SyncDriver};
