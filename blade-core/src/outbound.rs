use bytes::Bytes;

use crate::{CoreError, DeclaredFile, FileKey, UploadAnnounce};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    pub name: String,
    pub kind: String,
    pub bytes: Bytes,
}

impl OutboundFile {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.name.clone(), self.size())
    }

    pub fn announce(&self) -> UploadAnnounce {
        UploadAnnounce {
            filename: self.name.clone(),
            size: self.size(),
        }
    }

    pub fn declared(&self) -> DeclaredFile {
        DeclaredFile {
            name: self.name.clone(),
            size: self.size(),
            kind: self.kind.clone(),
        }
    }
}

/// Files selected for upload, in selection order.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    files: Vec<OutboundFile>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, file: OutboundFile) -> Result<(), CoreError> {
        let key = file.key();
        if self.files.iter().any(|existing| existing.key() == key) {
            return Err(CoreError::DuplicateFile(key));
        }
        self.files.push(file);
        Ok(())
    }

    /// Appends every file not already queued; returns how many were added.
    pub fn extend(&mut self, files: impl IntoIterator<Item = OutboundFile>) -> usize {
        files
            .into_iter()
            .filter_map(|file| self.push(file).ok())
            .count()
    }

    pub fn remove(&mut self, index: usize) -> Result<OutboundFile, CoreError> {
        if index >= self.files.len() {
            return Err(CoreError::IndexOutOfRange {
                index,
                len: self.files.len(),
            });
        }
        Ok(self.files.remove(index))
    }

    /// Drops the given keys, keeping anything selected after they were snapshotted.
    pub fn forget(&mut self, keys: &[FileKey]) {
        self.files.retain(|file| !keys.contains(&file.key()));
    }

    pub fn files(&self) -> &[OutboundFile] {
        &self.files
    }

    pub fn manifest(&self) -> Vec<DeclaredFile> {
        self.files.iter().map(OutboundFile::declared).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_by_name_and_size_are_suppressed() {
        let mut queue = OutboundQueue::new();
        queue.push(OutboundFile::new("a.txt", "text/plain", "abc")).unwrap();
        let err = queue
            .push(OutboundFile::new("a.txt", "text/plain", "xyz"))
            .unwrap_err();
        assert_eq!(err, CoreError::DuplicateFile(FileKey::new("a.txt", 3)));

        // Same name, different size is a different file.
        queue.push(OutboundFile::new("a.txt", "text/plain", "abcd")).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn extend_keeps_selection_order() {
        let mut queue = OutboundQueue::new();
        let added = queue.extend([
            OutboundFile::new("b", "", "1"),
            OutboundFile::new("a", "", "1"),
            OutboundFile::new("b", "", "1"),
        ]);
        assert_eq!(added, 2);
        let names: Vec<_> = queue.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn remove_by_position() {
        let mut queue = OutboundQueue::new();
        queue.extend([OutboundFile::new("a", "", "1"), OutboundFile::new("b", "", "2")]);
        let removed = queue.remove(0).unwrap();
        assert_eq!(removed.name, "a");
        assert_eq!(
            queue.remove(5),
            Err(CoreError::IndexOutOfRange { index: 5, len: 1 })
        );
    }

    #[test]
    fn forget_keeps_late_selections() {
        let mut queue = OutboundQueue::new();
        queue.extend([OutboundFile::new("a", "", "1"), OutboundFile::new("b", "", "2")]);
        let snapshot: Vec<FileKey> = queue.files().iter().map(OutboundFile::key).collect();
        queue.push(OutboundFile::new("c", "", "3")).unwrap();
        queue.forget(&snapshot);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.files()[0].name, "c");
    }

    #[test]
    fn manifest_carries_metadata_only() {
        let mut queue = OutboundQueue::new();
        queue
            .push(OutboundFile::new("pic.png", "image/png", vec![0_u8; 64]))
            .unwrap();
        let manifest = queue.manifest();
        assert_eq!(manifest[0].size, 64);
        assert_eq!(manifest[0].kind, "image/png");
    }
}
