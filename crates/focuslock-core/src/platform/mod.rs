pub mod local;
pub mod traits;

pub use local::{LogNavigator, LogSurface, StaticCatalog, TokioAlarms};
pub use traits::{
    AlarmId, AlarmScheduler, AppCatalog, BlockPrompt, BlockingSurface, SurfaceAction,
    SurfaceActions, SystemNavigator,
};
