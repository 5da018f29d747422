use std::path::{Path, PathBuf};

const PROCESSED_POSTFIX: &str = "_processed.nv12";
const METADATA_POSTFIX: &str = "_metadata.bin";
const IFRAME_POSTFIX: &str = "_iframes.bin";

fn with_postfix(video_path: &Path, postfix: &str) -> PathBuf {
    let stem = video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    video_path.with_file_name(format!("{stem}{postfix}"))
}

/// Packed frame stream the decoder reads, alongside the input video.
pub fn processed_video_path(video_path: &Path) -> PathBuf {
    with_postfix(video_path, PROCESSED_POSTFIX)
}

/// Binary `VideoMetadata` record alongside the input video.
pub fn metadata_path(video_path: &Path) -> PathBuf {
    with_postfix(video_path, METADATA_POSTFIX)
}

/// Binary keyframe index alongside the input video.
pub fn iframe_path(video_path: &Path) -> PathBuf {
    with_postfix(video_path, IFRAME_POSTFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_sit_beside_the_video() {
        let video = Path::new("/data/clips/cam3.y4m");
        assert_eq!(
            processed_video_path(video),
            Path::new("/data/clips/cam3_processed.nv12")
        );
        assert_eq!(
            metadata_path(video),
            Path::new("/data/clips/cam3_metadata.bin")
        );
        assert_eq!(iframe_path(video), Path::new("/data/clips/cam3_iframes.bin"));
    }
}
