//! A [`TransferEngine`] that shells out to `skopeo copy` into an OCI layout.
//!
//! Archives are spooled to a temporary file and copied from `docker-archive:`; registry sources
//! are copied from `docker://`. Either way the destination is `oci:<layout>:<name>`, so the
//! result is resolvable through [`OciLayoutStore`](crate::oci_layout::OciLayoutStore).

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};

use crate::{
    credentials::Credentials,
    platform::PlatformSet,
    progress::{ProgressEvent, ProgressSink},
    transfer::{RegistrySource, Source, StoreTarget, TransferEngine, TransferError},
};

/// Copies images with skopeo.
#[derive(Debug, Clone)]
pub struct SkopeoTransfer {
    skopeo: PathBuf,
    layout: PathBuf,
}

impl SkopeoTransfer {
    /// Copies into the OCI layout at `layout` using `skopeo` from `$PATH`.
    pub fn new(layout: impl Into<PathBuf>) -> Self {
        SkopeoTransfer {
            skopeo: PathBuf::from("skopeo"),
            layout: layout.into(),
        }
    }

    pub fn with_skopeo(mut self, skopeo: impl Into<PathBuf>) -> Self {
        self.skopeo = skopeo.into();
        self
    }

    fn destination(&self, target: &StoreTarget) -> Result<OsString, TransferError> {
        // The oci: transport splits the layout path from the image name at the first colon.
        let layout = self.layout.to_str().ok_or_else(|| {
            TransferError::Unsupported(format!("non-UTF-8 layout path {:?}", self.layout))
        })?;
        if layout.contains(':') {
            return Err(TransferError::Unsupported(format!(
                "layout path {layout:?} contains a colon"
            )));
        }
        Ok(format!("oci:{layout}:{}", target.name).into())
    }

    async fn run(
        &self,
        args: Vec<OsString>,
        progress: &Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        let command = format!(
            "{} {}",
            self.skopeo.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!("Running {command}");

        let mut child = Command::new(&self.skopeo)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let forward = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    progress.event(ProgressEvent::Message(line));
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let collect = async {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (forwarded, collected) = tokio::join!(forward, collect);
        forwarded?;
        let stderr = collected?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(TransferError::Process {
                command,
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn authfile(
        &self,
        source: &RegistrySource,
    ) -> Result<Option<NamedTempFile>, TransferError> {
        let credentials = source.credentials.resolve(&source.host).await.map_err(|err| {
            TransferError::Credentials {
                host: source.host.clone(),
                message: err.to_string(),
            }
        })?;
        let Some(credentials) = credentials else {
            return Ok(None);
        };

        let entry = match credentials {
            Credentials::Basic { username, password } => {
                json!({ "auth": STANDARD.encode(format!("{username}:{password}")) })
            }
            Credentials::IdentityToken(token) => json!({ "identitytoken": token }),
        };
        let mut auths = serde_json::Map::new();
        auths.insert(source.host.clone(), entry);
        let auths = json!({ "auths": auths });

        let file = NamedTempFile::new()?;
        tokio::fs::write(file.path(), auths.to_string()).await?;
        Ok(Some(file))
    }
}

/// Arguments selecting which platforms of a multi-platform image to copy.
///
/// skopeo can copy one platform or all of them; several platforms mean all.
fn platform_args(platforms: &PlatformSet) -> Vec<OsString> {
    let mut args: Vec<&str> = Vec::new();
    let mut platforms = platforms.iter();
    match (platforms.next(), platforms.next()) {
        (Some(platform), None) => {
            args.extend(["--multi-arch", "system"]);
            args.extend(["--override-os", platform.os()]);
            args.extend(["--override-arch", platform.architecture()]);
            if let Some(variant) = platform.variant() {
                args.extend(["--override-variant", variant]);
            }
        }
        _ => args.extend(["--multi-arch", "all"]),
    }
    args.into_iter().map(OsString::from).collect()
}

fn path_arg(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path);
    arg
}

#[async_trait]
impl TransferEngine for SkopeoTransfer {
    async fn transfer(
        &self,
        source: Source,
        target: &StoreTarget,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        let destination = self.destination(target)?;
        tokio::fs::create_dir_all(&self.layout).await?;

        match source {
            Source::Archive(mut reader) => {
                let spool = NamedTempFile::new()?;
                let mut file = tokio::fs::File::create(spool.path()).await?;
                let size = tokio::io::copy(&mut reader, &mut file).await?;
                file.flush().await?;
                drop(file);
                info!("Importing {size} byte archive as {}", target.name);

                let args = vec![
                    "copy".into(),
                    path_arg("docker-archive:", spool.path()),
                    destination,
                ];
                self.run(args, &progress).await
            }
            Source::Registry(registry) => {
                let authfile = self.authfile(&registry).await?;
                let mut args: Vec<OsString> = vec!["copy".into()];
                args.extend(platform_args(&target.platforms));
                if let Some(authfile) = &authfile {
                    args.push("--src-authfile".into());
                    args.push(authfile.path().into());
                }
                args.push(format!("docker://{}", registry.reference).into());
                args.push(destination);
                self.run(args, &progress).await
            }
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        credentials::{CredentialError, CredentialResolver, NoCredentials},
        progress::NoProgress,
        test::{platforms, RecordingProgress},
        transfer::Naming,
    };

    fn target(name: &str, platforms: PlatformSet) -> StoreTarget {
        StoreTarget {
            name: name.to_string(),
            platforms,
            all_metadata: false,
            naming: Naming::Reference,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_platform_args() {
        assert_eq!(
            strings(platform_args(&PlatformSet::any())),
            ["--multi-arch", "all"]
        );
        assert_eq!(
            strings(platform_args(&platforms(&["linux/amd64", "linux/arm64"]))),
            ["--multi-arch", "all"]
        );
        assert_eq!(
            strings(platform_args(&platforms(&["linux/arm/v6"]))),
            [
                "--multi-arch",
                "system",
                "--override-os",
                "linux",
                "--override-arch",
                "arm",
                "--override-variant",
                "v6"
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_colon_in_layout() {
        let transfer = SkopeoTransfer::new("/tmp/a:b");
        let source = Source::Archive(Box::pin(&b""[..]));
        let err = transfer
            .transfer(
                source,
                &target("x.example/y:z", PlatformSet::any()),
                Arc::new(RecordingProgress::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Unsupported(_)), "{err:?}");
    }

    struct Fixed(Credentials);

    #[async_trait]
    impl CredentialResolver for Fixed {
        async fn resolve(&self, _host: &str) -> Result<Option<Credentials>, CredentialError> {
            Ok(Some(self.0.clone()))
        }
    }

    /// Writes a fake skopeo that logs its arguments, copies any authfile, and prints progress.
    fn fake_skopeo(dir: &Path, exit: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("skopeo");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
echo "$@" > "{dir}/args"
while [ $# -gt 0 ]; do
  if [ "$1" = --src-authfile ]; then cp "$2" "{dir}/auth.json"; fi
  shift
done
echo "Copying blob sha256:1234"
echo "Writing manifest to image destination"
echo "something went wrong" >&2
exit {exit}
"#,
                dir = dir.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test_with::executable(sh)]
    #[test]
    fn test_registry_copy() {
        let dir = tempfile::tempdir().unwrap();
        let layout = dir.path().join("layout");
        let transfer = SkopeoTransfer::new(&layout).with_skopeo(fake_skopeo(dir.path(), 0));
        let progress = Arc::new(RecordingProgress::default());

        let source = Source::Registry(RegistrySource {
            reference: "registry.example/app:v1".to_string(),
            host: "registry.example".to_string(),
            credentials: Arc::new(Fixed(Credentials::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            })),
        });
        block_on(transfer.transfer(
            source,
            &target("registry.example/app:v1", platforms(&["linux/amd64"])),
            progress.clone(),
        ))
        .unwrap();

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("copy --multi-arch system --override-os linux --override-arch amd64 --src-authfile "), "{args}");
        assert!(
            args.trim_end().ends_with(&format!(
                "docker://registry.example/app:v1 oci:{}:registry.example/app:v1",
                layout.display()
            )),
            "{args}"
        );

        let auth: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("auth.json")).unwrap()).unwrap();
        assert_eq!(
            auth["auths"]["registry.example"]["auth"].as_str(),
            Some(STANDARD.encode("u:p").as_str())
        );

        assert_eq!(
            progress.events(),
            vec![
                ProgressEvent::Message("Copying blob sha256:1234".to_string()),
                ProgressEvent::Message("Writing manifest to image destination".to_string()),
            ]
        );
        assert!(layout.is_dir());
    }

    #[test_with::executable(sh)]
    #[test]
    fn test_archive_copy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let layout = dir.path().join("layout");
        let transfer = SkopeoTransfer::new(&layout).with_skopeo(fake_skopeo(dir.path(), 3));

        let source = Source::Archive(Box::pin(&b"archive bytes"[..]));
        let err = block_on(transfer.transfer(
            source,
            &StoreTarget {
                name: "docker.io/library/myimage:latest".to_string(),
                platforms: PlatformSet::any(),
                all_metadata: true,
                naming: Naming::Foreknown,
            },
            Arc::new(NoProgress),
        ))
        .unwrap_err();

        let TransferError::Process { status, stderr, .. } = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(status.code(), Some(3));
        assert_eq!(stderr, "something went wrong");

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("copy docker-archive:"), "{args}");
        assert!(
            args.trim_end()
                .ends_with(&format!("oci:{}:docker.io/library/myimage:latest", layout.display())),
            "{args}"
        );
    }

    #[test_with::executable(sh)]
    #[test]
    fn test_anonymous_registry_copy() {
        let dir = tempfile::tempdir().unwrap();
        let transfer =
            SkopeoTransfer::new(dir.path().join("layout")).with_skopeo(fake_skopeo(dir.path(), 0));
        let source = Source::Registry(RegistrySource {
            reference: "docker.io/library/busybox:latest".to_string(),
            host: "docker.io".to_string(),
            credentials: Arc::new(NoCredentials),
        });
        block_on(transfer.transfer(
            source,
            &target("docker.io/library/busybox:latest", PlatformSet::any()),
            Arc::new(NoProgress),
        ))
        .unwrap();

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("copy --multi-arch all docker://"), "{args}");
        assert!(!dir.path().join("auth.json").exists());
    }
}
