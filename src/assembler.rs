//! Local media assembly: one still image plus one audio track into a video file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AssembleError;
use crate::state_machine::VideoArtifact;

#[async_trait]
pub trait MediaAssembler: Send + Sync {
    /// Combine the song and image into a video and return a reference to it.
    ///
    /// Must stop promptly and return [`AssembleError::Cancelled`] once `cancel` fires.
    async fn assemble(
        &self,
        cancel: CancellationToken,
        job_id: &str,
        audio_url: &str,
        image_url: &str,
    ) -> Result<VideoArtifact, AssembleError>;
}

/// Assembles videos with the `ffmpeg` and `ffprobe` binaries.
pub struct FfmpegAssembler {
    ffmpeg_path: String,
    ffprobe_path: String,
    output_dir: PathBuf,
    /// Directory `file://` assets must live under. `None` accepts only remote assets.
    asset_root: Option<PathBuf>,
    http: reqwest::Client,
}

impl FfmpegAssembler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
            output_dir: output_dir.into(),
            asset_root: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_asset_root(mut self, root: Option<PathBuf>) -> Self {
        self.asset_root = root;
        self
    }

    fn build_args(image: &Path, audio: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-loop", "1", "-i"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(image.to_string_lossy().into_owned());
        args.push("-i".into());
        args.push(audio.to_string_lossy().into_owned());
        args.extend(
            [
                "-c:v", "libx264", "-tune", "stillimage", "-pix_fmt", "yuv420p", "-vf",
                "scale=1080:1920:force_original_aspect_ratio=decrease,pad=1080:1920:(ow-iw)/2:(oh-ih)/2",
                "-c:a", "aac", "-b:a", "192k", "-shortest", "-movflags", "+faststart",
            ]
            .into_iter()
            .map(String::from),
        );
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Bring an asset into `dir`. Remote URLs are downloaded; `file://` paths are copied
    /// when they resolve inside the asset root. Anything else is refused.
    async fn fetch_asset(&self, source: &str, dir: &Path, name: &str) -> Result<PathBuf, AssembleError> {
        let target = dir.join(name);
        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self
                .http
                .get(source)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| AssembleError::Download(format!("{source}: {e}")))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| AssembleError::Download(format!("{source}: {e}")))?;
            tokio::fs::write(&target, &bytes).await?;
        } else {
            let path = self.local_asset(source).await?;
            tokio::fs::copy(&path, &target).await?;
        }
        debug!(source, target = %target.display(), "asset fetched");
        Ok(target)
    }

    async fn local_asset(&self, source: &str) -> Result<PathBuf, AssembleError> {
        let path = source
            .strip_prefix("file://")
            .ok_or_else(|| AssembleError::Asset(format!("unsupported source {source}")))?;
        let Some(root) = &self.asset_root else {
            return Err(AssembleError::Asset(format!("local assets are disabled ({source})")));
        };
        let root = tokio::fs::canonicalize(root).await?;
        let resolved = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| AssembleError::Asset(format!("{path}: {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(AssembleError::Asset(format!(
                "{} is outside {}",
                resolved.display(),
                root.display()
            )));
        }
        Ok(resolved)
    }

    async fn run(&self, cancel: &CancellationToken, program: &str, args: &[String]) -> Result<String, AssembleError> {
        let child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(AssembleError::Cancelled),
            output = child.wait_with_output() => output?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(AssembleError::Encoder {
                status: output.status.to_string(),
                stderr: last.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe_duration(&self, cancel: &CancellationToken, path: &Path) -> Result<f64, AssembleError> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "csv=p=0".into(),
            path.to_string_lossy().into_owned(),
        ];
        let stdout = self.run(cancel, &self.ffprobe_path, &args).await?;
        stdout.trim().parse::<f64>().map_err(|_| AssembleError::Encoder {
            status: "ffprobe".into(),
            stderr: format!("unreadable duration {:?}", stdout.trim()),
        })
    }
}

#[async_trait]
impl MediaAssembler for FfmpegAssembler {
    async fn assemble(
        &self,
        cancel: CancellationToken,
        job_id: &str,
        audio_url: &str,
        image_url: &str,
    ) -> Result<VideoArtifact, AssembleError> {
        if cancel.is_cancelled() {
            return Err(AssembleError::Cancelled);
        }

        let work = tempfile::tempdir()?;
        let audio = self.fetch_asset(audio_url, work.path(), "audio").await?;
        let image = self.fetch_asset(image_url, work.path(), "image").await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = self.output_dir.join(format!("{job_id}.mp4"));
        let partial = work.path().join("video.mp4");

        let args = Self::build_args(&image, &audio, &partial);
        debug!(job_id, ?args, "running ffmpeg");
        self.run(&cancel, &self.ffmpeg_path, &args).await?;
        let duration_secs = self.probe_duration(&cancel, &partial).await?;

        // Copy rather than rename: the temp dir may sit on another filesystem.
        tokio::fs::copy(&partial, &output).await?;
        info!(job_id, output = %output.display(), duration_secs, "video written");

        Ok(VideoArtifact {
            artifact_ref: output.to_string_lossy().into_owned(),
            duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn args_put_output_last_and_loop_the_image() {
        let args = FfmpegAssembler::build_args(
            Path::new("/w/image"),
            Path::new("/w/audio"),
            Path::new("/w/out.mp4"),
        );
        assert_eq!(&args[..5], ["-y", "-loop", "1", "-i", "/w/image"]);
        assert!(args.contains(&"-shortest".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/w/out.mp4"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = assembler
            .assemble(cancel, "job", "/nope.mp3", "/nope.png")
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleError::Cancelled));
    }

    #[tokio::test]
    async fn fetch_asset_downloads_remote_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(dir.path());
        let fetched = assembler
            .fetch_asset(&format!("{}/a.mp3", server.uri()), dir.path(), "audio")
            .await
            .unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"ID3");
    }

    #[tokio::test]
    async fn missing_remote_asset_is_download_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(dir.path());
        let err = assembler
            .fetch_asset(&format!("{}/gone.png", server.uri()), dir.path(), "image")
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleError::Download(_)));
    }

    #[tokio::test]
    async fn local_assets_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cover.png");
        std::fs::write(&source, b"png").unwrap();
        let work = tempfile::tempdir().unwrap();

        let assembler = FfmpegAssembler::new(dir.path()).with_asset_root(Some(dir.path().into()));
        let fetched = assembler
            .fetch_asset(&format!("file://{}", source.display()), work.path(), "image")
            .await
            .unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"png");
    }

    #[tokio::test]
    async fn local_paths_outside_the_asset_root_are_refused() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(root.path()).with_asset_root(Some(root.path().into()));

        for source in [
            "/etc/passwd".to_string(),
            "file:///etc/passwd".to_string(),
            format!("file://{}/../etc/passwd", root.path().display()),
            format!("file://{}/missing.png", root.path().display()),
        ] {
            let err = assembler
                .fetch_asset(&source, work.path(), "image")
                .await
                .unwrap_err();
            assert!(matches!(err, AssembleError::Asset(_)), "{source}: {err:?}");
            assert!(!crate::error::PipelineError::from(err).is_transient());
        }
        assert!(std::fs::read_dir(work.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn local_assets_need_an_asset_root() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cover.png");
        std::fs::write(&source, b"png").unwrap();

        let assembler = FfmpegAssembler::new(dir.path());
        let err = assembler
            .fetch_asset(&format!("file://{}", source.display()), dir.path(), "image")
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleError::Asset(_)));
    }
}
