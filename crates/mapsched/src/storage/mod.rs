pub mod output;

pub use output::{
    is_thumbnail, remove_if_exists, OutputFile, OutputFiles, OutputStorage, StoredFile,
    THUMBNAIL_SUFFIX,
};
