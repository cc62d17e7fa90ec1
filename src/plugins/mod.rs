pub mod governance;
pub mod logging;

pub use governance::GovernancePlugin;
pub use logging::RequestLogPlugin;
