mod client;
mod links;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, FileList,
    parse_retry_after,
};
pub use links::extract_file_id;
