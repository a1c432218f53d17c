use crate::error::FileError;
use crate::ids::FileId;
use crate::location::InputFileToken;

pub trait DownloadCallback: Send + Sync {
    fn on_progress(&self, _file_id: FileId) {}
    fn on_download_ok(&self, file_id: FileId);
    fn on_download_error(&self, file_id: FileId, error: FileError);
}

pub trait UploadCallback: Send + Sync {
    fn on_progress(&self, _file_id: FileId) {}
    /// After this fires, further uploads of the file are paused until a merge,
    /// `delete_partial_remote_location`, `resume_upload`, or the server
    /// confirming the final identity.
    fn on_upload_ok(&self, file_id: FileId, token: InputFileToken);
    fn on_upload_encrypted_ok(&self, file_id: FileId, token: InputFileToken);
    fn on_upload_error(&self, file_id: FileId, error: FileError);
}
