mod error;
mod kind;
mod pointer;
mod record;
mod traits;
mod types;

pub use error::{ActiveOperation, ErrorClass, RuntimeError};
pub use kind::RuntimeKind;
pub use pointer::{DefaultPointer, PointerParseError};
pub use record::{RecordSet, VersionRecord};
pub use traits::{
    ArchiveService, ChangeEvent, ChangeNotifier, DependentEntityStore, EntityRef, ExtractOptions,
    MetadataCatalog, ProgressFn,
};
pub use types::{
    DownloadDescriptor, DownloadProgress, FullVersion, MajorVersion, OperationKind,
    RemoteMetadataEntry, VersionParseError,
};
