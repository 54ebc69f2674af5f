use {
    ninep_fs::QId,
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
};

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep_fs::Result<QId> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> QId {
    QId {
        typ: From::from(attr.file_type()),
        version: 0,
        path: attr.ino(),
    }
}
