//! Connection settings, the bit-exact transport-parameter codec
//! (RFC 9000 §18), and the persisted resumption record.

use crate::cid::Cid;
use crate::congestion::CongestionAlgorithm;
use crate::error::TransportError;
use crate::stream::StreamLimits;
use crate::types::{MAX_CID_LEN, RESET_TOKEN_LEN};
use crate::varint::{self, Reader};
use std::time::Duration;

// Transport parameter IDs (RFC 9000 §18.2, RFC 9221 §3).
const TP_ORIGINAL_DCID: u64 = 0x00;
const TP_MAX_IDLE_TIMEOUT: u64 = 0x01;
const TP_STATELESS_RESET_TOKEN: u64 = 0x02;
const TP_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const TP_INITIAL_MAX_DATA: u64 = 0x04;
const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const TP_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const TP_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const TP_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const TP_ACK_DELAY_EXPONENT: u64 = 0x0a;
const TP_MAX_ACK_DELAY: u64 = 0x0b;
const TP_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const TP_PREFERRED_ADDRESS: u64 = 0x0d;
const TP_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const TP_INITIAL_SOURCE_CID: u64 = 0x0f;
const TP_RETRY_SOURCE_CID: u64 = 0x10;
const TP_MAX_DATAGRAM_FRAME_SIZE: u64 = 0x20;

/// Per-connection configuration. Field defaults follow common deployment
/// values rather than the RFC's most conservative ones.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Connection-wide receive budget.
    pub max_data: u64,
    pub stream_data_bidi_local: u64,
    pub stream_data_bidi_remote: u64,
    pub stream_data_uni: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
    pub max_udp_payload_size: u64,
    pub active_cid_limit: u64,
    pub max_ack_delay: Duration,
    pub ack_delay_exponent: u64,
    pub disable_active_migration: bool,
    /// Zero disables the datagram extension.
    pub max_datagram_frame_size: u64,
    pub congestion: CongestionAlgorithm,
    /// Send a PING when nothing ack-eliciting has gone out for this long.
    pub keep_alive: Option<Duration>,
    /// Copy-and-complete sends up to the ideal buffer target.
    pub send_buffering: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_data: 16 * 1024 * 1024,
            stream_data_bidi_local: 1024 * 1024,
            stream_data_bidi_remote: 1024 * 1024,
            stream_data_uni: 1024 * 1024,
            max_streams_bidi: 100,
            max_streams_uni: 100,
            idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 65527,
            active_cid_limit: 4,
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            disable_active_migration: false,
            max_datagram_frame_size: 65527,
            congestion: CongestionAlgorithm::default(),
            keep_alive: None,
            send_buffering: true,
        }
    }
}

/// A peer's (or our own) transport parameters, decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParams {
    pub original_dcid: Option<Cid>,
    pub max_idle_timeout_ms: u64,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_LEN]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub disable_active_migration: bool,
    /// Raw preferred_address bytes; consumed by the CID layer if present.
    pub preferred_address: Option<Vec<u8>>,
    pub active_connection_id_limit: u64,
    pub initial_source_cid: Option<Cid>,
    pub retry_source_cid: Option<Cid>,
    pub max_datagram_frame_size: u64,
}

impl TransportParams {
    /// Our parameters, from settings plus the connection's identity.
    pub fn from_settings(
        settings: &Settings,
        initial_scid: Cid,
        original_dcid: Option<Cid>,
        retry_scid: Option<Cid>,
        reset_token: Option<[u8; RESET_TOKEN_LEN]>,
    ) -> Self {
        TransportParams {
            original_dcid,
            max_idle_timeout_ms: settings.idle_timeout.as_millis() as u64,
            stateless_reset_token: reset_token,
            max_udp_payload_size: settings.max_udp_payload_size,
            initial_max_data: settings.max_data,
            initial_max_stream_data_bidi_local: settings.stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: settings.stream_data_bidi_remote,
            initial_max_stream_data_uni: settings.stream_data_uni,
            initial_max_streams_bidi: settings.max_streams_bidi,
            initial_max_streams_uni: settings.max_streams_uni,
            ack_delay_exponent: settings.ack_delay_exponent,
            max_ack_delay_ms: settings.max_ack_delay.as_millis() as u64,
            disable_active_migration: settings.disable_active_migration,
            preferred_address: None,
            active_connection_id_limit: settings.active_cid_limit,
            initial_source_cid: Some(initial_scid),
            retry_source_cid: retry_scid,
            max_datagram_frame_size: settings.max_datagram_frame_size,
        }
    }

    pub fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.max_idle_timeout_ms > 0).then(|| Duration::from_millis(self.max_idle_timeout_ms))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        let put_varint = |out: &mut Vec<u8>, id: u64, value: u64| {
            varint::write(out, id);
            varint::write(out, varint::size(value) as u64);
            varint::write(out, value);
        };
        let put_bytes = |out: &mut Vec<u8>, id: u64, value: &[u8]| {
            varint::write(out, id);
            varint::write(out, value.len() as u64);
            out.extend_from_slice(value);
        };

        if let Some(cid) = &self.original_dcid {
            put_bytes(&mut out, TP_ORIGINAL_DCID, cid.as_slice());
        }
        if self.max_idle_timeout_ms > 0 {
            put_varint(&mut out, TP_MAX_IDLE_TIMEOUT, self.max_idle_timeout_ms);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_bytes(&mut out, TP_STATELESS_RESET_TOKEN, token);
        }
        put_varint(&mut out, TP_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_varint(&mut out, TP_INITIAL_MAX_DATA, self.initial_max_data);
        put_varint(
            &mut out,
            TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_varint(
            &mut out,
            TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_varint(&mut out, TP_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni);
        put_varint(&mut out, TP_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_varint(&mut out, TP_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_varint(&mut out, TP_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_varint(&mut out, TP_MAX_ACK_DELAY, self.max_ack_delay_ms);
        if self.disable_active_migration {
            put_bytes(&mut out, TP_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(addr) = &self.preferred_address {
            put_bytes(&mut out, TP_PREFERRED_ADDRESS, addr);
        }
        put_varint(&mut out, TP_ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit);
        if let Some(cid) = &self.initial_source_cid {
            put_bytes(&mut out, TP_INITIAL_SOURCE_CID, cid.as_slice());
        }
        if let Some(cid) = &self.retry_source_cid {
            put_bytes(&mut out, TP_RETRY_SOURCE_CID, cid.as_slice());
        }
        if self.max_datagram_frame_size > 0 {
            put_varint(&mut out, TP_MAX_DATAGRAM_FRAME_SIZE, self.max_datagram_frame_size);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        let mut params = TransportParams {
            // RFC defaults for absent parameters.
            max_udp_payload_size: 65527,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            active_connection_id_limit: 2,
            ..Default::default()
        };
        let err = TransportError::TransportParameterError;

        let mut r = Reader::new(buf);
        let mut seen = Vec::new();
        while !r.is_empty() {
            let id = r.varint().map_err(|_| err("truncated id"))?;
            let value = r.varint_bytes().map_err(|_| err("truncated value"))?;
            if seen.contains(&id) {
                return Err(err("duplicate parameter"));
            }
            seen.push(id);

            let as_varint = || -> Result<u64, TransportError> {
                let mut vr = Reader::new(value);
                let v = vr.varint().map_err(|_| err("bad integer"))?;
                if !vr.is_empty() {
                    return Err(err("trailing bytes in integer"));
                }
                Ok(v)
            };
            let as_cid = || -> Result<Cid, TransportError> {
                if value.len() > MAX_CID_LEN {
                    return Err(err("cid too long"));
                }
                Ok(Cid::from_slice(value))
            };

            match id {
                TP_ORIGINAL_DCID => params.original_dcid = Some(as_cid()?),
                TP_MAX_IDLE_TIMEOUT => params.max_idle_timeout_ms = as_varint()?,
                TP_STATELESS_RESET_TOKEN => {
                    let token: [u8; RESET_TOKEN_LEN] =
                        value.try_into().map_err(|_| err("bad reset token length"))?;
                    params.stateless_reset_token = Some(token);
                }
                TP_MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = as_varint()?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(err("max_udp_payload_size below 1200"));
                    }
                }
                TP_INITIAL_MAX_DATA => params.initial_max_data = as_varint()?,
                TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = as_varint()?
                }
                TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = as_varint()?
                }
                TP_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = as_varint()?
                }
                TP_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = as_varint()?;
                    if params.initial_max_streams_bidi > 1 << 60 {
                        return Err(err("streams limit too large"));
                    }
                }
                TP_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = as_varint()?;
                    if params.initial_max_streams_uni > 1 << 60 {
                        return Err(err("streams limit too large"));
                    }
                }
                TP_ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = as_varint()?;
                    if params.ack_delay_exponent > 20 {
                        return Err(err("ack_delay_exponent above 20"));
                    }
                }
                TP_MAX_ACK_DELAY => {
                    params.max_ack_delay_ms = as_varint()?;
                    if params.max_ack_delay_ms >= 1 << 14 {
                        return Err(err("max_ack_delay too large"));
                    }
                }
                TP_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(err("disable_active_migration not empty"));
                    }
                    params.disable_active_migration = true;
                }
                TP_PREFERRED_ADDRESS => params.preferred_address = Some(value.to_vec()),
                TP_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = as_varint()?;
                    if params.active_connection_id_limit < 2 {
                        return Err(err("active_connection_id_limit below 2"));
                    }
                }
                TP_INITIAL_SOURCE_CID => params.initial_source_cid = Some(as_cid()?),
                TP_RETRY_SOURCE_CID => params.retry_source_cid = Some(as_cid()?),
                TP_MAX_DATAGRAM_FRAME_SIZE => {
                    params.max_datagram_frame_size = as_varint()?
                }
                // Unknown parameters (including grease) are skipped.
                _ => {}
            }
        }
        Ok(params)
    }

    /// Combined stream limits once both sides' parameters are known.
    pub fn stream_limits(local: &Settings, peer: &TransportParams) -> StreamLimits {
        StreamLimits {
            local_max_data: local.max_data,
            peer_max_data: peer.initial_max_data,
            local_max_streams: [local.max_streams_bidi, local.max_streams_uni],
            peer_max_streams: [peer.initial_max_streams_bidi, peer.initial_max_streams_uni],
            peer_stream_data_bidi_local: peer.initial_max_stream_data_bidi_local,
            peer_stream_data_bidi_remote: peer.initial_max_stream_data_bidi_remote,
            peer_stream_data_uni: peer.initial_max_stream_data_uni,
            local_stream_data_bidi_local: local.stream_data_bidi_local,
            local_stream_data_bidi_remote: local.stream_data_bidi_remote,
            local_stream_data_uni: local.stream_data_uni,
        }
    }
}

// =============================================================================
// RESUMPTION RECORD
// =============================================================================

/// Length-prefixed record handed to the external store for session
/// resumption: version, the server's transport parameters, the server
/// name, and the TLS ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionRecord {
    pub version: u32,
    pub params: Vec<u8>,
    pub server_name: String,
    pub ticket: Vec<u8>,
}

impl ResumptionRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            10 + self.params.len() + self.server_name.len() + self.ticket.len(),
        );
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.params.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.params);
        out.extend_from_slice(&(self.server_name.len() as u16).to_be_bytes());
        out.extend_from_slice(self.server_name.as_bytes());
        out.extend_from_slice(&self.ticket);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        let err = TransportError::FrameEncodingError("bad resumption record");
        let mut r = Reader::new(buf);
        let version = r.u32().map_err(|_| err.clone())?;
        let params_len = u16::from_be_bytes(r.bytes(2).map_err(|_| err.clone())?.try_into().unwrap());
        let params = r.bytes(params_len as usize).map_err(|_| err.clone())?.to_vec();
        let name_len = u16::from_be_bytes(r.bytes(2).map_err(|_| err.clone())?.try_into().unwrap());
        let name = r.bytes(name_len as usize).map_err(|_| err.clone())?;
        let server_name = String::from_utf8(name.to_vec()).map_err(|_| err.clone())?;
        let ticket = r.rest().to_vec();
        Ok(ResumptionRecord { version, params, server_name, ticket })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QUIC_VERSION_1;

    #[test]
    fn params_roundtrip() {
        let settings = Settings::default();
        let scid = Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let odcid = Cid::from_slice(&[9; 8]);
        let params =
            TransportParams::from_settings(&settings, scid, Some(odcid), None, Some([7; 16]));
        let encoded = params.encode();
        let decoded = TransportParams::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn absent_parameters_use_defaults() {
        let params = TransportParams::decode(&[]).unwrap();
        assert_eq!(params.active_connection_id_limit, 2);
        assert_eq!(params.ack_delay_exponent, 3);
        assert_eq!(params.max_ack_delay_ms, 25);
        assert_eq!(params.max_datagram_frame_size, 0);
    }

    #[test]
    fn invalid_values_rejected() {
        // ack_delay_exponent = 21
        let mut buf = Vec::new();
        varint::write(&mut buf, TP_ACK_DELAY_EXPONENT);
        varint::write(&mut buf, 1);
        varint::write(&mut buf, 21);
        assert!(TransportParams::decode(&buf).is_err());

        // active_connection_id_limit = 1
        let mut buf = Vec::new();
        varint::write(&mut buf, TP_ACTIVE_CONNECTION_ID_LIMIT);
        varint::write(&mut buf, 1);
        varint::write(&mut buf, 1);
        assert!(TransportParams::decode(&buf).is_err());

        // duplicated parameter
        let mut buf = Vec::new();
        for _ in 0..2 {
            varint::write(&mut buf, TP_INITIAL_MAX_DATA);
            varint::write(&mut buf, 1);
            varint::write(&mut buf, 5);
        }
        assert!(TransportParams::decode(&buf).is_err());
    }

    #[test]
    fn unknown_parameters_skipped() {
        let mut buf = Vec::new();
        varint::write(&mut buf, 0x1b660a93); // grease-style id
        varint::write(&mut buf, 3);
        buf.extend_from_slice(&[1, 2, 3]);
        varint::write(&mut buf, TP_INITIAL_MAX_DATA);
        varint::write(&mut buf, 2);
        varint::write(&mut buf, 5000);
        let params = TransportParams::decode(&buf).unwrap();
        assert_eq!(params.initial_max_data, 5000);
    }

    #[test]
    fn resumption_record_roundtrip() {
        let record = ResumptionRecord {
            version: QUIC_VERSION_1,
            params: vec![1, 2, 3, 4],
            server_name: "example.com".into(),
            ticket: vec![9; 64],
        };
        assert_eq!(ResumptionRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn truncated_record_rejected() {
        let record = ResumptionRecord {
            version: 1,
            params: vec![1, 2, 3],
            server_name: "x".into(),
            ticket: vec![],
        };
        let bytes = record.encode();
        assert!(ResumptionRecord::decode(&bytes[..5]).is_err());
    }
}
