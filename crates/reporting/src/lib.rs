//! Subscription analytics and reporting: funnels, cohort retention,
//! and the dashboard query facade.

pub mod dashboard;
pub mod funnel;
pub mod retention;

pub use dashboard::DashboardService;
pub use funnel::FunnelAnalyzer;
pub use retention::RetentionAnalyzer;
