//! Ready-made descriptors for the usual receive topologies. Element names
//! match the default port bindings.

use crate::payload::{MediaKind, PayloadTypeMap, RtxMap};

const CNAME_SDES: &str = r#"sdes="application/x-rtp-source-sdes,cname=(string)\"mtun.io\"""#;

/// Static receive pipeline: rtpsession, retransmission, jitter buffer and
/// depayloader for the first payload type of `kind` in `payloads`.
/// Returns `None` if `payloads` has no entry of that kind.
pub fn rtp_receive(kind: MediaKind, payloads: &PayloadTypeMap, rtx: &RtxMap) -> Option<String> {
    let (pt, info) = (0..=127u8)
        .filter_map(|pt| payloads.get(pt).map(|info| (pt, info)))
        .find(|(_, info)| info.media == kind)?;
    let caps = payloads.caps(pt)?;

    let mut rtx_stage = String::new();
    if let Some(rtx_pt) = rtx.rtx_for(pt) {
        let map: RtxMap = [(pt, rtx_pt)].into_iter().collect();
        rtx_stage = format!(
            "rtprtxreceive payload-type-map=\"{}\" ! ",
            map.to_caps_string()
        );
    }

    Some(format!(
        "rtpsession name=rtpsession rtp-profile=avpf {sdes} \
         appsrc name=rtpappsrc is-live=true format=time caps=\"{caps}\" ! rtpsession.recv_rtp_sink \
         appsrc name=rtcpappsrc is-live=true caps=\"application/x-rtcp\" ! rtpsession.recv_rtcp_sink \
         rtpsession.recv_rtp_src ! {rtx_stage}rtpstorage size-time=220000000 ! \
         rtpjitterbuffer do-lost=true do-retransmission=true name=rtpjitterbuffer ! \
         {depay} ! appsink name=bufferappsink \
         rtpsession.send_rtcp_src ! appsink name=rtcpappsink sync=false async=false",
        sdes = CNAME_SDES,
        caps = caps,
        rtx_stage = rtx_stage,
        depay = info.codec.depayloader(),
    ))
}

/// rtpbin variant: one `recv_rtp_src_<session>_<ssrc>_<pt>` pad per source,
/// wired at runtime. `rtpbin` is named `demux` so the default config finds it.
pub fn rtpbin_demux(latency_ms: u32) -> String {
    format!(
        "rtpbin name=demux latency={} do-retransmission=true {} \
         appsrc name=rtpappsrc is-live=true format=time caps=\"application/x-rtp\" ! demux.recv_rtp_sink_0 \
         appsrc name=rtcpappsrc is-live=true caps=\"application/x-rtcp\" ! demux.recv_rtcp_sink_0 \
         demux.send_rtcp_src_0 ! appsink name=rtcpappsink sync=false async=false",
        latency_ms, CNAME_SDES
    )
}

/// What the in-process engine understands of the rtpbin variant.
pub fn memory_demux() -> String {
    "appsrc name=rtpappsrc ! rtpdemux name=demux \
     appsrc name=rtcpappsrc ! fakesink"
        .to_string()
}
