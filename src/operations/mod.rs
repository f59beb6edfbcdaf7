/// Module for removing remote entries
pub(crate) mod delete;

/// Module for downloading files from the device
pub(crate) mod download;

/// Module for listing remote directory contents
pub(crate) mod list;

/// Module for uploading files to the device
pub(crate) mod upload;
