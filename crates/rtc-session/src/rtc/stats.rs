//! StatsReport to metrics sample

use crate::peer::ConnectionMetricsSample;
use webrtc::stats::{StatsReport, StatsReportType};

/// Reduce a webrtc-rs stats report to one sample
///
/// Transport figures come from the nominated candidate pair; loss is the
/// cumulative ratio of packets the remote side reported lost to packets
/// sent. RTT prefers the remote-inbound measurement and falls back to the
/// candidate pair. webrtc-rs does not report jitter for outbound streams, so
/// `jitter_ms` stays zero.
pub fn collect(report: &StatsReport) -> ConnectionMetricsSample {
    let mut sample = ConnectionMetricsSample::default();
    let mut local_candidate_id = None;
    let mut pair_rtt_ms = 0.0;
    let mut rtt_sum = 0.0;
    let mut rtt_count = 0u32;
    let mut packets_sent: u64 = 0;
    let mut packets_lost: i64 = 0;

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                sample.bytes_sent = pair.bytes_sent;
                sample.bytes_received = pair.bytes_received;
                pair_rtt_ms = pair.current_round_trip_time * 1000.0;
                local_candidate_id = Some(pair.local_candidate_id.clone());
            }
            StatsReportType::OutboundRTP(rtp) => {
                packets_sent += rtp.packets_sent;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                packets_lost += remote.packets_lost.max(0);
                if let Some(rtt) = remote.round_trip_time {
                    rtt_sum += rtt * 1000.0;
                    rtt_count += 1;
                }
            }
            StatsReportType::Codec(codec) => {
                if !sample.codecs.contains(&codec.mime_type) {
                    sample.codecs.push(codec.mime_type.clone());
                }
            }
            _ => {}
        }
    }

    if let Some(id) = local_candidate_id {
        if let Some(StatsReportType::LocalCandidate(candidate)) = report.reports.get(&id) {
            sample.candidate_type = Some(candidate.candidate_type.to_string());
            sample.protocol = Some(transport_protocol(&candidate.network_type.to_string()));
        }
    }

    sample.rtt_ms = if rtt_count > 0 {
        rtt_sum / f64::from(rtt_count)
    } else {
        pair_rtt_ms
    };
    sample.packet_loss = if packets_sent > 0 {
        (packets_lost as f64 / packets_sent as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    sample.codecs.sort();
    sample
}

/// `udp4` -> `udp`
fn transport_protocol(network_type: &str) -> String {
    network_type
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_ascii_lowercase()
}
