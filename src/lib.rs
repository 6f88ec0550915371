pub mod app;

pub use app::config::{load_config, save_config, AppConfig};
pub use app::error::AppError;
pub use app::events::{BusEvent, EventBus};
pub use app::log_store::{LogEntry, LogFilter, LogLevel, LogStore};
pub use app::logging::init_logging;
pub use app::models::{
    BackupOptions, CommandResponse, DeviceRecord, DeviceState, OperationSummary, PackageScope,
    RebootMode,
};
pub use app::service::DeviceService;
