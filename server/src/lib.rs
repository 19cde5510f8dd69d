pub mod cache;
pub mod routes;
pub mod state;

pub use cache::SearchCache;
pub use routes::app;
pub use state::AppState;
