//! Data shapes exchanged over HTTP and the progress socket.
//!
//! Field names follow the JSON the browser client already speaks
//! (`fileID`, `folderSize`, ...), hence the explicit serde renames.

pub mod folder;
pub mod object;
pub mod progress;
