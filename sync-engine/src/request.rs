//! Serving side: answers peers' block requests.
//!
//! Every request is checked before a single byte is read: the device must
//! share the folder, the name must be canonical, no component of the path
//! may be a symlink, and the file must not be ignored or invalid locally.
//! When the requester supplies a hash the bytes are verified before they
//! leave, and a mismatch triggers a rescan of the file.

use std::io;

use sync_core::{validate_name, verify_block, MAX_BLOCK_SIZE};
use sync_types::{BlockInfo, DeviceId, FileInfo, Request};

use crate::error::RequestError;
use crate::folder::Folder;
use crate::scanner;

pub(crate) async fn serve(
    folder: &Folder,
    device: &DeviceId,
    request: &Request,
) -> Result<Vec<u8>, RequestError> {
    let name = request.name.as_str();

    if !folder.is_member(device) {
        tracing::warn!(folder = %folder.id(), %device, "request from device not sharing folder");
        return Err(RequestError::Generic(format!(
            "folder {} not shared with {device}",
            folder.id()
        )));
    }
    if let Err(e) = validate_name(name) {
        tracing::debug!(folder = %folder.id(), %device, error = %e, "request for invalid name");
        return Err(RequestError::InvalidFile(name.to_string()));
    }
    if request.offset < 0 || request.size < 0 || request.size > MAX_BLOCK_SIZE {
        return Err(RequestError::InvalidFile(name.to_string()));
    }

    if let Some(link) = folder.fs.symlink_in_path(name, true).await? {
        tracing::warn!(
            folder = %folder.id(),
            %device,
            %name,
            %link,
            "rejecting request through symlink"
        );
        return Err(RequestError::PermissionDenied(name.to_string()));
    }

    let local = folder
        .index
        .local(name)
        .await
        .map_err(|e| RequestError::Generic(e.to_string()))?;
    if folder.ignores.is_ignored(name) || local.as_ref().is_some_and(FileInfo::is_invalid) {
        tracing::debug!(folder = %folder.id(), %device, %name, "request for ignored or invalid file");
        return Err(RequestError::InvalidFile(name.to_string()));
    }

    let expected = (!request.hash.is_empty()).then(|| BlockInfo {
        offset: request.offset,
        size: request.size,
        hash: request.hash.clone(),
        weak_hash: request.weak_hash,
    });
    let size = usize::try_from(request.size)
        .map_err(|_| RequestError::InvalidFile(name.to_string()))?;

    if request.from_temporary {
        if let Some(job) = folder.inflight.get(name) {
            match folder.fs.read_at(&job.temp, request.offset, size).await {
                Ok(data) if expected.as_ref().map_or(true, |b| verify_block(b, &data)) => {
                    return Ok(data);
                }
                _ => {
                    tracing::debug!(folder = %folder.id(), %name, "temp file cannot serve block, using target");
                }
            }
        }
    }

    let data = match folder.fs.read_at(name, request.offset, size).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RequestError::NoSuchFile(name.to_string()));
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && expected.is_some() => {
            return Err(stale(folder, name, request.offset).await);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(block) = &expected {
        if !verify_block(block, &data) {
            return Err(stale(folder, name, request.offset).await);
        }
    }
    Ok(data)
}

/// The file changed since it was indexed: rescan it so the next index
/// update tells peers what it holds now.
async fn stale(folder: &Folder, name: &str, offset: i64) -> RequestError {
    tracing::info!(folder = %folder.id(), %name, offset, "requested block changed on disk, rescanning");
    if let Err(e) = scanner::rescan(folder, &[name.to_string()]).await {
        folder.report(Some(name), &e);
    }
    RequestError::HashMismatch {
        name: name.to_string(),
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::InFlightJob;
    use crate::testutil::{fixture, fixture_with, Fixture, FOLDER};
    use std::sync::Arc;
    use sync_core::hash_block;
    use sync_types::{ErrorCode, VersionVector};
    use tokio_util::sync::CancellationToken;

    fn request(name: &str, offset: i64, size: i32) -> Request {
        Request {
            id: 1,
            folder: FOLDER.to_string(),
            name: name.to_string(),
            offset,
            size,
            hash: Vec::new(),
            weak_hash: 0,
            from_temporary: false,
        }
    }

    fn request_block(name: &str, data: &[u8]) -> Request {
        let block = hash_block(0, data);
        Request {
            hash: block.hash,
            weak_hash: block.weak_hash,
            ..request(name, 0, data.len() as i32)
        }
    }

    async fn serve_as_remote(fx: &Fixture, req: &Request) -> Result<Vec<u8>, RequestError> {
        fx.folder.serve(&fx.remote, req).await
    }

    #[tokio::test]
    async fn serves_requested_range() {
        let fx = fixture();
        fx.write("testfile", b"test file contents\n");
        fx.folder.scan(&[]).await.unwrap();

        let data = serve_as_remote(&fx, &request("testfile", 5, 4)).await.unwrap();
        assert_eq!(data, b"file");
    }

    #[tokio::test]
    async fn changed_file_fails_hash_and_rescans() {
        let fx = fixture();
        fx.write("foo", b"hello");
        let scanned = fx.folder.scan(&[]).await.unwrap();
        assert_eq!(scanned[0].blocks[0].weak_hash, 103547413);

        let req = request_block("foo", b"hello");
        assert_eq!(serve_as_remote(&fx, &req).await.unwrap(), b"hello");

        fx.write("foo", b"bye");
        let err = serve_as_remote(&fx, &req).await.unwrap_err();
        assert!(matches!(err, RequestError::HashMismatch { .. }));
        assert_eq!(err.code(), ErrorCode::Generic);

        let rescanned = fx.folder.index().local("foo").await.unwrap().unwrap();
        assert_eq!(rescanned.blocks[0].weak_hash, 41943361);
    }

    #[tokio::test]
    async fn same_size_change_is_detected_by_hash() {
        let fx = fixture();
        fx.write("foo", b"hello");
        fx.folder.scan(&[]).await.unwrap();
        fx.write("foo", b"jello");

        let err = serve_as_remote(&fx, &request_block("foo", b"hello")).await.unwrap_err();
        assert!(matches!(err, RequestError::HashMismatch { offset: 0, .. }));
    }

    #[tokio::test]
    async fn missing_file_is_no_such_file() {
        let fx = fixture();
        let err = serve_as_remote(&fx, &request("nope", 0, 1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchFile);
    }

    #[tokio::test]
    async fn non_member_gets_generic_error() {
        let fx = fixture();
        fx.write("foo", b"hello");
        let err = fx
            .folder
            .serve(&DeviceId::random(), &request("foo", 0, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Generic(_)));
    }

    #[tokio::test]
    async fn escaping_names_are_invalid() {
        let fx = fixture();
        for name in ["../outside", "/etc/passwd", "a/../../b", ".syncmesh/trash/x"] {
            let err = serve_as_remote(&fx, &request(name, 0, 1)).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidFile, "{name}");
        }
    }

    #[tokio::test]
    async fn negative_range_is_invalid() {
        let fx = fixture();
        fx.write("foo", b"hello");
        let err = serve_as_remote(&fx, &request("foo", -1, 1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFile);
    }

    #[tokio::test]
    async fn oversized_range_is_invalid() {
        let fx = fixture();
        fx.write("foo", b"hello");
        fx.folder.scan(&[]).await.unwrap();

        for size in [MAX_BLOCK_SIZE + 1, i32::MAX] {
            let err = serve_as_remote(&fx, &request("foo", 0, size)).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidFile);
        }
        let data = serve_as_remote(&fx, &request("foo", 0, 5)).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn ignored_file_is_not_served() {
        let fx = fixture_with(
            |config| config,
            |folder| folder.with_ignores(Arc::new(|name: &str| name == "secret")),
        );
        fx.write("secret", b"shh");
        let err = serve_as_remote(&fx, &request("secret", 0, 3)).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidFile(_)));
    }

    #[tokio::test]
    async fn invalid_local_record_is_not_served() {
        let fx = fixture();
        fx.write("foo", b"hello");
        let mut record = fx.folder.scan(&[]).await.unwrap().remove(0);
        record.flags.invalid = true;
        fx.folder.index().commit_local(vec![record]).await.unwrap();

        let err = serve_as_remote(&fx, &request("foo", 0, 5)).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidFile(_)));
    }

    #[tokio::test]
    async fn serves_from_temp_file_when_asked() {
        let fx = fixture();
        let version = VersionVector::new();
        let temp = sync_core::temp_name_for("big", &version);
        fx.write(&temp, b"partial");
        fx.folder.inflight.register(
            "big",
            InFlightJob {
                version,
                temp,
                token: CancellationToken::new(),
            },
        );

        let mut req = request_block("big", b"partial");
        req.from_temporary = true;
        assert_eq!(serve_as_remote(&fx, &req).await.unwrap(), b"partial");

        req.from_temporary = false;
        let err = serve_as_remote(&fx, &req).await.unwrap_err();
        assert!(matches!(err, RequestError::NoSuchFile(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_anywhere_in_path_is_denied() {
        let outside = tempfile::tempdir().unwrap();
        crate::testutil::write(outside.path(), "b/c/file", b"secret");
        crate::testutil::write(outside.path(), "c/file", b"secret");
        crate::testutil::write(outside.path(), "file", b"secret");

        // Symlink at each ancestor position, and at the final component.
        let cases = [
            ("a", outside.path().to_path_buf(), "a/b/c/file"),
            ("a/b", outside.path().to_path_buf(), "a/b/c/file"),
            ("a/b/c", outside.path().to_path_buf(), "a/b/c/file"),
            ("a/b/c/file", outside.path().join("file"), "a/b/c/file"),
        ];
        for (link, target, requested) in cases {
            let fx = fixture();
            let link_path = fx.path(link);
            std::fs::create_dir_all(link_path.parent().unwrap()).unwrap();
            std::os::unix::fs::symlink(&target, &link_path).unwrap();

            let err = serve_as_remote(&fx, &request(requested, 0, 6)).await.unwrap_err();
            assert!(
                matches!(err, RequestError::PermissionDenied(_)),
                "symlink at {link}: {err:?}"
            );
            assert_eq!(err.code(), ErrorCode::InvalidFile);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relative_parent_symlink_is_denied() {
        let fx = fixture();
        std::os::unix::fs::symlink("..", fx.path("symlink")).unwrap();
        let err = serve_as_remote(&fx, &request("symlink/testfile", 0, 1)).await.unwrap_err();
        assert!(matches!(err, RequestError::PermissionDenied(_)));
    }
}
