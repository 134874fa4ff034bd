pub mod repository;
pub mod store;
pub mod transcode;

pub use repository::{AvatarInfo, AvatarRepository};
pub use store::{BlobStore, StoredBlob, UploadKind};
pub use transcode::{Transcoder, is_image};
