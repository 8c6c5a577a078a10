//! Launch-description builders
//!
//! Graphs are expressed in the framework's textual description language and
//! realized with a single parse call, the same way an operator would test
//! them from a shell. Encoder settings are fixed here rather than exposed as
//! configuration: the preview path must stay decodable by browser WebRTC
//! stacks behind the broker, which means H.264 baseline without B-frames.
//!
//! Rate control uses the Rockchip encoder's quantization mode with
//! qp-init=26, qp-min=10, qp-max=51, and one keyframe every two seconds at
//! the negotiated framerate.

use std::path::Path;

/// Element name of the recording valve in the tee graph. The supervisor
/// toggles recording by flipping this element's `drop` property.
pub const REC_VALVE: &str = "rec_valve";

/// Keyframe interval in seconds
const GOP_SECONDS: u32 = 2;

/// Parameters shared by both ingest graph variants
#[derive(Debug, Clone)]
pub struct IngestGraphParams<'a> {
    pub device: &'a str,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub rtsp_url: &'a str,
}

impl IngestGraphParams<'_> {
    fn gop(&self) -> u32 {
        (GOP_SECONDS * self.framerate).max(1)
    }

    fn encoder(&self) -> String {
        format!(
            "mpph264enc qp-init=26 qp-min=10 qp-max=51 gop={gop} profile=baseline \
             bps={bps} ! h264parse config-interval=-1",
            gop = self.gop(),
            bps = self.bitrate_kbps as u64 * 1000,
        )
    }

    fn source(&self) -> String {
        format!(
            "v4l2src device={device} io-mode=dmabuf ! \
             video/x-raw,format=NV12,width={width},height={height},framerate={framerate}/1 ! \
             videoconvert",
            device = self.device,
            width = self.width,
            height = self.height,
            framerate = self.framerate.max(1),
        )
    }

    fn broker_sink(&self) -> String {
        format!(
            "rtspclientsink location={url} protocols=tcp latency=0",
            url = self.rtsp_url
        )
    }
}

/// Preview-only ingest graph (subscriber recording variant).
///
/// capture -> format tag -> convert -> encode -> broker publish.
/// Every consumer, recording included, subscribes through the broker.
pub fn ingest_graph(params: &IngestGraphParams<'_>) -> String {
    format!(
        "{source} ! {encoder} ! {sink}",
        source = params.source(),
        encoder = params.encoder(),
        sink = params.broker_sink(),
    )
}

/// Tee ingest graph with a valve-gated recording branch.
///
/// The stream is encoded once and split after the parser; the preview
/// branch publishes to the broker while the recording branch sits behind a
/// valve that is built closed (`drop=true`), so no frame reaches the muxer
/// until recording is explicitly started.
pub fn tee_recording_graph(
    params: &IngestGraphParams<'_>,
    recording_path: &Path,
    fragment_duration_ms: u32,
) -> String {
    format!(
        "{source} ! {encoder} ! tee name=t \
         t. ! queue leaky=downstream max-size-buffers=30 ! {broker} \
         t. ! queue ! valve name={valve} drop=true ! \
         mp4mux fragment-duration={fragment} ! filesink location={path} sync=false",
        source = params.source(),
        encoder = params.encoder(),
        broker = params.broker_sink(),
        valve = REC_VALVE,
        fragment = fragment_duration_ms,
        path = recording_path.display(),
    )
}

/// Subscriber recording graph.
///
/// Pulls the already-encoded stream back out of the broker and remuxes it
/// into fragmented MP4. No decode, no re-encode; stopping or crashing this
/// graph cannot disturb the ingest side.
pub fn subscriber_graph(source_url: &str, output_path: &Path, fragment_duration_ms: u32) -> String {
    format!(
        "rtspsrc location={url} protocols=tcp latency=0 ! \
         rtph264depay ! h264parse ! \
         mp4mux fragment-duration={fragment} ! filesink location={path} sync=false",
        url = source_url,
        fragment = fragment_duration_ms,
        path = output_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params() -> IngestGraphParams<'static> {
        IngestGraphParams {
            device: "/dev/video60",
            width: 1920,
            height: 1080,
            framerate: 60,
            bitrate_kbps: 4000,
            rtsp_url: "rtsp://127.0.0.1:8554/cam1",
        }
    }

    #[test]
    fn test_ingest_graph_encoder_contract() {
        let desc = ingest_graph(&params());
        assert!(desc.contains("v4l2src device=/dev/video60"));
        assert!(desc.contains("width=1920,height=1080,framerate=60/1"));
        assert!(desc.contains("qp-init=26 qp-min=10 qp-max=51"));
        assert!(desc.contains("profile=baseline"));
        // One keyframe every 2 seconds at 60 fps
        assert!(desc.contains("gop=120"));
        assert!(desc.contains("bps=4000000"));
        assert!(desc.contains("rtspclientsink location=rtsp://127.0.0.1:8554/cam1"));
        assert!(!desc.contains("tee"));
    }

    #[test]
    fn test_tee_graph_valve_starts_closed() {
        let desc = tee_recording_graph(&params(), &PathBuf::from("/tmp/out.mp4"), 1000);
        assert!(desc.contains("tee name=t"));
        assert!(desc.contains("valve name=rec_valve drop=true"));
        assert!(desc.contains("mp4mux fragment-duration=1000"));
        assert!(desc.contains("filesink location=/tmp/out.mp4"));
        // Single encoder: the split happens after the parser
        assert_eq!(desc.matches("mpph264enc").count(), 1);
    }

    #[test]
    fn test_subscriber_graph_has_no_encoder() {
        let desc = subscriber_graph(
            "rtsp://127.0.0.1:8554/cam1",
            &PathBuf::from("/rec/S1_cam1_20260101_120000.mp4"),
            1000,
        );
        assert!(desc.contains("rtspsrc location=rtsp://127.0.0.1:8554/cam1"));
        assert!(desc.contains("rtph264depay ! h264parse"));
        assert!(desc.contains("filesink location=/rec/S1_cam1_20260101_120000.mp4"));
        assert!(!desc.contains("enc"));
        assert!(!desc.contains("decodebin"));
    }

    #[test]
    fn test_gop_never_zero() {
        let mut p = params();
        p.framerate = 0;
        assert!(ingest_graph(&p).contains("gop=1"));
    }
}
