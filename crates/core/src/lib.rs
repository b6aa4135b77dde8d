pub mod backup;
pub mod clock;
pub mod error;
pub mod identity;

pub use backup::{
    backup_name, is_auto_backup_name, is_valid_backup_name, Backup, BackupMeta, BackupRequest,
    META_FILE,
};
pub use clock::{Clock, SystemClock};
pub use error::{ArchiveFault, Cause, LauncherError};
pub use identity::DbName;
