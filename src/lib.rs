pub mod args;
pub mod cache;
pub mod config;
pub mod r#const;
pub mod error;
pub mod handler;
pub mod router;
pub mod ruleset;
pub mod server;
pub mod supervisor;
pub mod upstream;

// 重导出常用组件
pub use args::Args;
pub use cache::{DecisionCaches, DecisionResult, MatchType, PatternCache};
pub use config::Config;
pub use error::AppError;
pub use handler::ProxyHandler;
pub use router::Router;
pub use ruleset::Ruleset;
pub use server::ProxyServer;
pub use supervisor::{ControlSignal, Supervisor};
pub use upstream::Upstream;
