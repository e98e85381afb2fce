use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::fs::MetadataExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use farmhand_castore::{
    blobservice::{BlobReader, BlobService, MemoryBlobService},
    cache::{Cache, LocalCache},
    fixtures::{
        BLOB_A_DIGEST, BLOB_B_DIGEST, DIRECTORY_WITH_BLOBS, DUMMY_DIGEST, EMPTY_BLOB_DIGEST,
        HELLOWORLD_BLOB_CONTENTS, HELLOWORLD_BLOB_DIGEST,
    },
    DirectoriesIndex, Digest, DigestFunction, Directory, Node,
};
use lazy_static::lazy_static;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use super::{Error, ExecDirInputs, ExecFileSystem, Violation};
use crate::action::{Action, Command};

lazy_static! {
    static ref LIB_DIGEST: Digest = DIRECTORY_WITH_BLOBS.digest(DigestFunction::Sha256);
}

struct Fixture {
    _tmpdir: TempDir,
    cache: Arc<LocalCache<MemoryBlobService>>,
    exec: ExecFileSystem,
}

/// An exec filesystem and a cache on the same filesystem, so hard links
/// work. The blob service holds `blobs`.
async fn fixture(blobs: &[&'static [u8]], patterns: &[&str]) -> Fixture {
    let tmpdir = TempDir::new().unwrap();
    let blob_service = MemoryBlobService::default();
    for blob in blobs {
        blob_service.put(DigestFunction::Sha256, *blob);
    }

    let cache = Arc::new(
        LocalCache::new(tmpdir.path().join("cache"), blob_service)
            .await
            .unwrap(),
    );
    let exec = ExecFileSystem::new(tmpdir.path().join("exec"), cache.clone())
        .with_linked_input_directories(patterns)
        .unwrap();

    Fixture {
        _tmpdir: tmpdir,
        cache,
        exec,
    }
}

fn file(digest: &Digest, executable: bool) -> Node {
    Node::File {
        digest: digest.clone(),
        executable,
    }
}

/// Builds an action whose input root holds `nodes`, and an index covering
/// it and the `lib` directory.
fn action(nodes: Vec<(&str, Node)>) -> (Action, Arc<DirectoriesIndex>) {
    let mut root = Directory::new();
    for (name, node) in nodes {
        root.add(name, node).unwrap();
    }
    let root_digest = root.digest(DigestFunction::Sha256);

    let index = HashMap::from([
        (root_digest.clone(), root),
        (LIB_DIGEST.clone(), DIRECTORY_WITH_BLOBS.clone()),
    ]);

    (
        Action {
            command_digest: DUMMY_DIGEST.clone(),
            input_root_digest: root_digest,
        },
        Arc::new(index),
    )
}

fn lib() -> Node {
    Node::Directory {
        digest: LIB_DIGEST.clone(),
    }
}

/// `a` is empty, `b` is a regular file, `lib` matches the link pattern.
#[tokio::test]
async fn materialize_links_files_and_directories() {
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]], &["lib"]).await;
    let (action, index) = action(vec![
        ("a", file(&EMPTY_BLOB_DIGEST, false)),
        ("b", file(&HELLOWORLD_BLOB_DIGEST, false)),
        ("lib", lib()),
    ]);

    let exec_dir = f
        .exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("must succeed");

    assert_eq!(f.exec.root().join("op"), exec_dir);

    assert_eq!(0, std::fs::metadata(exec_dir.join("a")).unwrap().len());

    let cache_path = f.cache.root().join(f.cache.key(&HELLOWORLD_BLOB_DIGEST, false));
    assert_eq!(
        std::fs::metadata(&cache_path).unwrap().ino(),
        std::fs::metadata(exec_dir.join("b")).unwrap().ino()
    );

    assert_eq!(
        f.cache.root().join(f.cache.directory_key(&LIB_DIGEST)),
        std::fs::read_link(exec_dir.join("lib")).unwrap()
    );
    assert_eq!(
        HELLOWORLD_BLOB_CONTENTS,
        std::fs::read(exec_dir.join("lib/hello.txt")).unwrap()
    );

    assert_eq!(
        Some(ExecDirInputs {
            files: vec![f.cache.key(&HELLOWORLD_BLOB_DIGEST, false)],
            directories: vec![LIB_DIGEST.clone()],
        }),
        f.exec.exec_dir_inputs(&exec_dir)
    );
}

#[tokio::test]
async fn empty_files_bypass_the_cache() {
    // nothing in the blob service
    let f = fixture(&[], &[]).await;
    let (action, index) = action(vec![
        ("empty", file(&EMPTY_BLOB_DIGEST, false)),
        ("empty_exec", file(&EMPTY_BLOB_DIGEST, true)),
    ]);

    let exec_dir = f
        .exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("must succeed");

    assert_eq!(0, std::fs::metadata(exec_dir.join("empty")).unwrap().len());
    assert_eq!(0, f.cache.references(&f.cache.key(&EMPTY_BLOB_DIGEST, false)));
    assert_eq!(0, f.cache.references(&f.cache.key(&EMPTY_BLOB_DIGEST, true)));
    assert_eq!(
        Some(ExecDirInputs::default()),
        f.exec.exec_dir_inputs(&exec_dir)
    );
}

#[tokio::test]
async fn outputs_are_never_linked() {
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]], &["lib"]).await;
    let (action, index) = action(vec![("lib", lib())]);
    let command = Command {
        output_files: vec!["lib/out.txt".into()],
        ..Default::default()
    };

    let exec_dir = f
        .exec
        .create_exec_dir("op", index, &action, &command, &CancellationToken::new())
        .await
        .expect("must succeed");

    let meta = std::fs::symlink_metadata(exec_dir.join("lib")).unwrap();
    assert!(meta.is_dir());
    assert!(exec_dir.join("lib/tool").is_file());
    assert_eq!(
        0,
        f.cache.references(&f.cache.directory_key(&LIB_DIGEST))
    );
    assert!(f
        .exec
        .exec_dir_inputs(&exec_dir)
        .unwrap()
        .directories
        .is_empty());
}

#[tokio::test]
async fn all_violations_reported_and_rolled_back() {
    // BLOB_A and BLOB_B are missing from the blob service.
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS], &[]).await;
    let (action, index) = action(vec![
        ("b", file(&HELLOWORLD_BLOB_DIGEST, false)),
        ("missing_a", file(&BLOB_A_DIGEST, false)),
        ("missing_b", file(&BLOB_B_DIGEST, true)),
    ]);

    let err = f
        .exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");

    let (path, violations) = match err {
        Error::Violations { path, violations } => (path, violations),
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(f.exec.root().join("op"), path);
    assert_eq!(
        HashSet::from([PathBuf::from("missing_a"), PathBuf::from("missing_b")]),
        violations
            .iter()
            .map(|v| v.path().clone())
            .collect::<HashSet<_>>()
    );
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::Input {
            executable: true,
            ..
        }
    )));

    assert!(!path.exists());
    assert_eq!(
        0,
        f.cache.references(&f.cache.key(&HELLOWORLD_BLOB_DIGEST, false))
    );
    assert_eq!(None, f.exec.exec_dir_inputs(&path));
}

#[tokio::test]
async fn missing_directory_is_a_violation() {
    let f = fixture(&[], &[]).await;
    let (action, index) = action(vec![(
        "sub",
        Node::Directory {
            digest: DUMMY_DIGEST.clone(),
        },
    )]);

    let err = f
        .exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");

    assert!(matches!(
        err,
        Error::Violations { ref violations, .. }
            if matches!(violations.as_slice(), [Violation::MissingDirectory { .. }])
    ));
}

#[tokio::test]
async fn absolute_symlink_targets() {
    let (action, index) = action(vec![(
        "passwd",
        Node::Symlink {
            target: "/etc/passwd".into(),
        },
    )]);

    let f = fixture(&[], &[]).await;
    let err = f
        .exec
        .create_exec_dir(
            "op",
            index.clone(),
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        Error::Violations { ref violations, .. }
            if matches!(violations.as_slice(), [Violation::AbsoluteSymlink { .. }])
    ));

    let f = fixture(&[], &[]).await;
    let exec = f.exec.allow_symlink_target_absolute(true);
    let exec_dir = exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("must succeed");
    assert_eq!(
        PathBuf::from("/etc/passwd"),
        std::fs::read_link(exec_dir.join("passwd")).unwrap()
    );
}

#[tokio::test]
async fn cancelled_before_start() {
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS], &[]).await;
    let (action, index) = action(vec![("b", file(&HELLOWORLD_BLOB_DIGEST, false))]);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = f
        .exec
        .create_exec_dir("op", index, &action, &Command::default(), &cancel)
        .await
        .expect_err("must fail");

    assert!(matches!(err, Error::Interrupted));
    assert!(!f.exec.root().join("op").exists());
}

/// Serves blobs from `inner`, except that reading `stall` never completes.
struct Stalling {
    inner: MemoryBlobService,
    stall: Digest,
}

#[async_trait]
impl BlobService for Stalling {
    async fn has(&self, digest: &Digest) -> io::Result<bool> {
        self.inner.has(digest).await
    }

    async fn open_read(&self, digest: &Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        if digest == &self.stall {
            std::future::pending::<()>().await;
        }
        self.inner.open_read(digest).await
    }
}

#[tokio::test]
async fn cancelled_while_placing() {
    let tmpdir = TempDir::new().unwrap();
    let inner = MemoryBlobService::default();
    inner.put(DigestFunction::Sha256, HELLOWORLD_BLOB_CONTENTS);
    let cache = Arc::new(
        LocalCache::new(
            tmpdir.path().join("cache"),
            Stalling {
                inner,
                stall: BLOB_A_DIGEST.clone(),
            },
        )
        .await
        .unwrap(),
    );
    let exec = ExecFileSystem::new(tmpdir.path().join("exec"), cache.clone());

    let (action, index) = action(vec![
        ("a", file(&BLOB_A_DIGEST, false)),
        ("b", file(&HELLOWORLD_BLOB_DIGEST, false)),
    ]);
    let key = cache.key(&HELLOWORLD_BLOB_DIGEST, false);
    let cancel = CancellationToken::new();

    let command = Command::default();
    let create = exec.create_exec_dir("op", index, &action, &command, &cancel);
    let cancel_once_fetched = async {
        for _ in 0..200 {
            if cache.references(&key) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(1, cache.references(&key));
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(create, cancel_once_fetched);

    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(!exec.root().join("op").exists());
    assert_eq!(0, cache.references(&key));
    assert_eq!(None, exec.exec_dir_inputs(&exec.root().join("op")));
}

/// Has no blobs, and replaces `exec_dir` with a plain file when asked for
/// one, so the exec dir can't be removed afterwards.
struct Clobbering {
    exec_dir: PathBuf,
}

#[async_trait]
impl BlobService for Clobbering {
    async fn has(&self, _digest: &Digest) -> io::Result<bool> {
        Ok(false)
    }

    async fn open_read(&self, _digest: &Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        std::fs::remove_dir_all(&self.exec_dir)?;
        std::fs::write(&self.exec_dir, b"")?;
        Ok(None)
    }
}

#[tokio::test]
async fn failed_cleanup_keeps_the_violations() {
    let tmpdir = TempDir::new().unwrap();
    let exec_root = tmpdir.path().join("exec");
    let cache = Arc::new(
        LocalCache::new(
            tmpdir.path().join("cache"),
            Clobbering {
                exec_dir: exec_root.join("op"),
            },
        )
        .await
        .unwrap(),
    );
    let exec = ExecFileSystem::new(exec_root.clone(), cache);
    let (action, index) = action(vec![("a", file(&BLOB_A_DIGEST, false))]);

    let err = exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");

    assert!(matches!(
        err,
        Error::Violations { ref violations, .. }
            if matches!(violations.as_slice(), [Violation::Input { .. }])
    ));
    assert!(exec_root.join("op").is_file());
}

#[tokio::test]
async fn stale_directory_replaced_and_outputs_stamped() {
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS], &[]).await;
    let (action, index) = action(vec![("b", file(&HELLOWORLD_BLOB_DIGEST, false))]);
    let command = Command {
        output_directories: vec!["gen".into()],
        working_directory: "out".into(),
        ..Default::default()
    };

    let stale = f.exec.root().join("op/stale");
    std::fs::create_dir_all(&stale).unwrap();

    let exec_dir = f
        .exec
        .create_exec_dir("op", index, &action, &command, &CancellationToken::new())
        .await
        .expect("must succeed");

    assert!(!stale.exists());
    assert!(exec_dir.join("out/gen").is_dir());
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let f = fixture(&[HELLOWORLD_BLOB_CONTENTS], &[]).await;
    let (action, index) = action(vec![("b", file(&HELLOWORLD_BLOB_DIGEST, false))]);
    let key = f.cache.key(&HELLOWORLD_BLOB_DIGEST, false);

    let exec_dir = f
        .exec
        .create_exec_dir(
            "op",
            index,
            &action,
            &Command::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("must succeed");
    assert_eq!(1, f.cache.references(&key));

    f.exec.destroy_exec_dir(&exec_dir).await.unwrap();
    assert!(!exec_dir.exists());
    assert_eq!(0, f.cache.references(&key));

    f.exec.destroy_exec_dir(&exec_dir).await.unwrap();
    f.exec
        .destroy_exec_dir(&f.exec.root().join("never-created"))
        .await
        .unwrap();
    assert_eq!(0, f.cache.references(&key));
}
