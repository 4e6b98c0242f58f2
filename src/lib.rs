pub mod proxy;

// Re-export commonly used items for convenience
pub use proxy::{build_router, AppState, ProxyError, Settings};
