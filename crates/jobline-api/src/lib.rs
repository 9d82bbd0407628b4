pub mod conversations;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use jobline_core::MessagingService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub service: MessagingService,
    pub jwt_secret: String,
}
