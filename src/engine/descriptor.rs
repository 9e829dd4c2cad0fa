//! Shell-source media descriptors.
//!
//! The native engine consumes a shell command line whose stdout is raw
//! PCM (audio) or raw YUV (video). This module builds those command
//! strings: transcoder invocation, reconnect flags for remote sources,
//! seek and filter parameter routing, and the tempo filter chain.

use serde::{Deserialize, Serialize};

pub const SAMPLE_RATE: u32 = 96_000;
pub const CHANNELS: u8 = 2;
pub const VIDEO_WIDTH: u32 = 1280;
pub const VIDEO_HEIGHT: u32 = 720;
pub const VIDEO_FPS: u32 = 30;

const RECONNECT_FLAGS: &str =
    "-reconnect 1 -reconnect_at_eof 1 -reconnect_streamed 1 -reconnect_delay_max 2";

/// Input description handed to the native engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Local path or URL the commands read from.
    pub source: String,
    pub is_video: bool,
    /// Command producing s16le PCM on stdout.
    pub audio_command: String,
    /// Command producing raw yuv420p frames on stdout; video tracks only.
    pub video_command: Option<String>,
}

/// Extra transcoder parameters split by where they belong relative to the
/// input flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorParams {
    /// Before `-i` (seek and demuxer options).
    pub pre_input: Vec<String>,
    /// After `-i` (filters and output-side options).
    pub post_input: Vec<String>,
}

impl DescriptorParams {
    /// Route a raw parameter string: any flag mentioning `filter:` (and its
    /// values) lands after the input, everything else before it.
    #[must_use]
    pub fn route(raw: &str) -> Self {
        let mut params = Self::default();
        let mut post = false;
        for token in raw.split_whitespace() {
            if token.starts_with('-') {
                post = token.contains("filter:");
            }
            if post {
                params.post_input.push(token.to_string());
            } else {
                params.pre_input.push(token.to_string());
            }
        }
        params
    }

    fn pre_str(&self) -> String {
        self.pre_input.join(" ")
    }

    fn post_str(&self) -> String {
        self.post_input.join(" ")
    }
}

#[must_use]
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Build the descriptor for a source, with optional extra parameters
/// already routed to their positions.
#[must_use]
pub fn build_descriptor(source: &str, is_video: bool, params: &DescriptorParams) -> MediaDescriptor {
    let audio_command = build_command(source, params, AUDIO_OUTPUT);
    let video_command = is_video.then(|| build_command(source, params, VIDEO_OUTPUT));

    MediaDescriptor {
        source: source.to_string(),
        is_video,
        audio_command,
        video_command,
    }
}

const AUDIO_OUTPUT: &str = "-f s16le -ac 2 -ar 96000 -v quiet pipe:1";
const VIDEO_OUTPUT: &str = "-f rawvideo -r 30 -pix_fmt yuv420p -vf scale=1280:720 -v quiet pipe:1";

fn build_command(source: &str, params: &DescriptorParams, output: &str) -> String {
    let mut parts: Vec<String> = vec!["ffmpeg".to_string()];

    if is_remote(source) {
        parts.push(RECONNECT_FLAGS.to_string());
    }
    let pre = params.pre_str();
    if !pre.is_empty() {
        parts.push(pre);
    }
    parts.push(format!("-i \"{source}\""));
    let post = params.post_str();
    if !post.is_empty() {
        parts.push(post);
    }
    parts.push(output.to_string());

    parts.join(" ")
}

/// Seek parameters: start at `to` and stop at `duration`. For remote
/// sources the stop flag has to ride on the output side, after the
/// reconnecting input.
#[must_use]
pub fn seek_params(source: &str, to_secs: u32, duration_secs: u32) -> DescriptorParams {
    if is_remote(source) {
        DescriptorParams {
            pre_input: vec!["-ss".to_string(), to_secs.to_string()],
            post_input: vec!["-to".to_string(), duration_secs.to_string()],
        }
    } else {
        DescriptorParams {
            pre_input: vec![
                "-ss".to_string(),
                to_secs.to_string(),
                "-to".to_string(),
                duration_secs.to_string(),
            ],
            post_input: Vec::new(),
        }
    }
}

/// Playback-speed parameters: video frames get retimed, audio runs through
/// a tempo chain.
#[must_use]
pub fn speed_params(factor: f64, is_video: bool) -> DescriptorParams {
    let mut post_input = Vec::new();
    if is_video {
        post_input.push("-filter:v".to_string());
        post_input.push(format!("setpts=({:.4})*PTS", 1.0 / factor));
    }
    post_input.push("-filter:a".to_string());
    post_input.push(atempo_chain(factor));

    DescriptorParams {
        pre_input: Vec::new(),
        post_input,
    }
}

/// Chain of `atempo` stages multiplying to `factor`, each within the
/// filter's [0.5, 2.0] envelope.
#[must_use]
pub fn atempo_chain(factor: f64) -> String {
    let mut stages: Vec<f64> = Vec::new();
    let mut remaining = factor;
    while remaining > 2.0 {
        stages.push(2.0);
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        stages.push(0.5);
        remaining /= 0.5;
    }
    stages.push(remaining);

    stages
        .iter()
        .map(|s| format!("atempo={s:.2}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_command_shape() {
        let desc = build_descriptor("/tmp/music/a.mp3", false, &DescriptorParams::default());
        assert_eq!(
            desc.audio_command,
            "ffmpeg -i \"/tmp/music/a.mp3\" -f s16le -ac 2 -ar 96000 -v quiet pipe:1"
        );
        assert!(desc.video_command.is_none());
    }

    #[test]
    fn test_video_adds_raw_frame_output() {
        let desc = build_descriptor("/tmp/music/a.mp4", true, &DescriptorParams::default());
        let video = desc.video_command.unwrap();
        assert!(video.contains("-f rawvideo"));
        assert!(video.contains("-r 30"));
        assert!(video.contains("-pix_fmt yuv420p"));
        assert!(video.contains("-vf scale=1280:720"));
        // Audio leg still produced
        assert!(desc.audio_command.contains("-ar 96000"));
    }

    #[test]
    fn test_remote_sources_get_reconnect_flags() {
        let remote = build_descriptor(
            "https://cdn.example.com/a.mp3",
            false,
            &DescriptorParams::default(),
        );
        assert!(remote
            .audio_command
            .starts_with("ffmpeg -reconnect 1 -reconnect_at_eof 1 -reconnect_streamed 1 -reconnect_delay_max 2"));

        let local = build_descriptor("/tmp/a.mp3", false, &DescriptorParams::default());
        assert!(!local.audio_command.contains("-reconnect"));
    }

    #[test]
    fn test_param_routing() {
        let params = DescriptorParams::route("-ss 40 -to 90 -filter:a atempo=1.50");
        assert_eq!(params.pre_input, vec!["-ss", "40", "-to", "90"]);
        assert_eq!(params.post_input, vec!["-filter:a", "atempo=1.50"]);

        let desc = build_descriptor("/tmp/a.mp3", false, &params);
        assert_eq!(
            desc.audio_command,
            "ffmpeg -ss 40 -to 90 -i \"/tmp/a.mp3\" -filter:a atempo=1.50 -f s16le -ac 2 -ar 96000 -v quiet pipe:1"
        );
    }

    #[test]
    fn test_seek_params_local_vs_remote() {
        let local = seek_params("/tmp/a.mp3", 40, 90);
        assert_eq!(local.pre_input, vec!["-ss", "40", "-to", "90"]);
        assert!(local.post_input.is_empty());

        let remote = seek_params("https://cdn.example.com/a.mp3", 40, 90);
        assert_eq!(remote.pre_input, vec!["-ss", "40"]);
        assert_eq!(remote.post_input, vec!["-to", "90"]);
    }

    #[test]
    fn test_atempo_chain_stays_in_envelope() {
        assert_eq!(atempo_chain(1.5), "atempo=1.50");
        assert_eq!(atempo_chain(2.0), "atempo=2.00");
        assert_eq!(atempo_chain(3.0), "atempo=2.00,atempo=1.50");
        assert_eq!(atempo_chain(4.0), "atempo=2.00,atempo=2.00");
        assert_eq!(atempo_chain(0.5), "atempo=0.50");

        // Every stage within [0.5, 2.0], product equals the factor
        for factor in [0.5, 0.75, 1.0, 1.25, 2.5, 3.3, 4.0] {
            let chain = atempo_chain(factor);
            let product: f64 = chain
                .split(',')
                .map(|s| s.trim_start_matches("atempo=").parse::<f64>().unwrap())
                .inspect(|stage| {
                    assert!((0.5..=2.0).contains(stage), "stage {stage} out of envelope")
                })
                .product();
            assert!((product - factor).abs() < 0.02, "{chain} != {factor}");
        }
    }

    #[test]
    fn test_speed_params_video_retimes_frames() {
        let params = speed_params(2.0, true);
        assert_eq!(
            params.post_input,
            vec!["-filter:v", "setpts=(0.5000)*PTS", "-filter:a", "atempo=2.00"]
        );

        let audio_only = speed_params(2.0, false);
        assert_eq!(audio_only.post_input, vec!["-filter:a", "atempo=2.00"]);
    }
}
