//! Session descriptions (RFC 4566) carried in INVITE and 200 bodies.
//!
//! ```text
//! v=0                                   protocol version
//! o=- 0 0 IN IP4 127.0.0.1              originator
//! s=Audio Session                       session name
//! c=IN IP4 127.0.0.1                    connection address
//! t=0 0                                 timing
//! m=audio 5004 RTP/AVP 0 96             media line: port + payload types
//! a=rtpmap:0 PCMU/8000/1                one rate-map per payload type
//! a=rtpmap:96 L16/8000/1
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::{CallConfig, Codec};
use crate::error::{CallError, Result};

/// `a=rtpmap` entry: payload type to codec name, clock rate, channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl From<&Codec> for RtpMap {
    fn from(codec: &Codec) -> Self {
        // ---
        Self {
            payload_type: codec.payload_type,
            encoding: codec.name.clone(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
        }
    }
}

/// One `m=` section with its rate-map entries and remaining attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmaps: Vec<RtpMap>,
    pub attributes: Vec<String>,
}

impl MediaDescription {
    // ---
    /// Rate-map entry for `payload_type`, if present.
    pub fn rtpmap(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|m| m.payload_type == payload_type)
    }
}

/// Parsed session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: u32,
    pub origin: String,
    pub session_name: String,
    pub connection: Option<IpAddr>,
    pub timing: (u64, u64),
    pub attributes: Vec<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    // ---
    /// Builds an audio offer/answer naming `media_port` and every
    /// configured codec.
    pub fn for_endpoint(config: &CallConfig, media_port: u16) -> Self {
        // ---
        let ip_version = if config.local_ip.is_ipv4() { "IP4" } else { "IP6" };

        Self {
            version: 0,
            origin: format!("- 0 0 IN {} {}", ip_version, config.local_ip),
            session_name: "Audio Session".to_string(),
            connection: Some(config.local_ip),
            timing: (0, 0),
            attributes: Vec::new(),
            media: vec![MediaDescription {
                media: "audio".to_string(),
                port: media_port,
                protocol: "RTP/AVP".to_string(),
                formats: config.codecs.iter().map(|c| c.payload_type).collect(),
                rtpmaps: config.codecs.iter().map(RtpMap::from).collect(),
                attributes: Vec::new(),
            }],
        }
    }

    /// Checks that every payload type on a media line has exactly one
    /// rate-map entry.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedSdp`] naming the first offending type.
    pub fn validate(&self) -> Result<()> {
        // ---
        for m in &self.media {
            for pt in &m.formats {
                let count = m.rtpmaps.iter().filter(|r| r.payload_type == *pt).count();
                if count != 1 {
                    return Err(CallError::MalformedSdp(format!(
                        "payload type {pt} has {count} rtpmap entries on m={} line",
                        m.media
                    )));
                }
            }
        }
        Ok(())
    }

    /// Address media should be sent to: connection address + first audio port.
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        // ---
        let ip = self.connection?;
        self.media
            .iter()
            .find(|m| m.media == "audio" && m.port != 0)
            .map(|m| SocketAddr::new(ip, m.port))
    }

    /// Parses and validates a description.
    ///
    /// Unknown line types are skipped. Attributes before the first `m=`
    /// line are session-level; later ones belong to the preceding media.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedSdp`] on malformed lines, a missing
    /// `v=` line, or a failed [`validate`](Self::validate).
    pub fn parse(text: &str) -> Result<Self> {
        // ---
        let mut sdp = Self {
            version: u32::MAX,
            origin: String::new(),
            session_name: String::new(),
            connection: None,
            timing: (0, 0),
            attributes: Vec::new(),
            media: Vec::new(),
        };

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| malformed(format!("invalid line: {line}")))?;

            match kind {
                "v" => {
                    sdp.version = value
                        .parse()
                        .map_err(|_| malformed(format!("invalid version: {value}")))?
                }
                "o" => sdp.origin = value.to_string(),
                "s" => sdp.session_name = value.to_string(),
                "c" => sdp.connection = Some(parse_connection(value)?),
                "t" => sdp.timing = parse_timing(value)?,
                "m" => sdp.media.push(parse_media(value)?),
                "a" => match sdp.media.last_mut() {
                    Some(media) => match value.strip_prefix("rtpmap:") {
                        Some(map) => media.rtpmaps.push(parse_rtpmap(map)?),
                        None => media.attributes.push(value.to_string()),
                    },
                    None => sdp.attributes.push(value.to_string()),
                },
                _ => tracing::debug!(line, "skipping unsupported SDP line"),
            }
        }

        if sdp.version == u32::MAX {
            return Err(malformed("missing v= line".to_string()));
        }
        sdp.validate()?;
        Ok(sdp)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(ip) = self.connection {
            let ip_version = if ip.is_ipv4() { "IP4" } else { "IP6" };
            write!(f, "c=IN {ip_version} {ip}\r\n")?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;
        for attr in &self.attributes {
            write!(f, "a={attr}\r\n")?;
        }
        for m in &self.media {
            let formats: Vec<String> = m.formats.iter().map(u8::to_string).collect();
            write!(f, "m={} {} {} {}\r\n", m.media, m.port, m.protocol, formats.join(" "))?;
            for map in &m.rtpmaps {
                write!(
                    f,
                    "a=rtpmap:{} {}/{}/{}\r\n",
                    map.payload_type, map.encoding, map.clock_rate, map.channels
                )?;
            }
            for attr in &m.attributes {
                write!(f, "a={attr}\r\n")?;
            }
        }
        Ok(())
    }
}

fn malformed(msg: String) -> CallError {
    CallError::MalformedSdp(msg)
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    // ---
    let parts: Vec<&str> = value.split_whitespace().collect();
    match parts.as_slice() {
        ["IN", "IP4" | "IP6", addr] => addr
            .parse()
            .map_err(|_| malformed(format!("invalid connection address: {addr}"))),
        _ => Err(malformed(format!("invalid connection line: {value}"))),
    }
}

fn parse_timing(value: &str) -> Result<(u64, u64)> {
    // ---
    let mut parts = value.split_whitespace().map(str::parse::<u64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(start)), Some(Ok(stop))) => Ok((start, stop)),
        _ => Err(malformed(format!("invalid timing line: {value}"))),
    }
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    // ---
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(malformed(format!("invalid media line: {value}")));
    }

    let port = parts[1]
        .parse()
        .map_err(|_| malformed(format!("invalid media port: {}", parts[1])))?;
    let formats = parts[3..]
        .iter()
        .map(|pt| match pt.parse::<u8>() {
            Ok(pt) if pt < 128 => Ok(pt),
            _ => Err(malformed(format!("invalid payload type: {pt}"))),
        })
        .collect::<Result<Vec<u8>>>()?;

    Ok(MediaDescription {
        media: parts[0].to_string(),
        port,
        protocol: parts[2].to_string(),
        formats,
        rtpmaps: Vec::new(),
        attributes: Vec::new(),
    })
}

/// Parses `<pt> <encoding>/<clock>[/<channels>]`; channels default to 1.
fn parse_rtpmap(value: &str) -> Result<RtpMap> {
    // ---
    let err = || malformed(format!("invalid rtpmap: {value}"));

    let (pt, encoding) = value.split_once(' ').ok_or_else(err)?;
    let mut fields = encoding.trim().split('/');

    let payload_type = pt.parse().map_err(|_| err())?;
    let encoding = fields.next().filter(|e| !e.is_empty()).ok_or_else(err)?;
    let clock_rate = fields
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(err)?;
    let channels = match fields.next() {
        Some(c) => c.parse().map_err(|_| err())?,
        None => 1,
    };

    Ok(RtpMap {
        payload_type,
        encoding: encoding.to_string(),
        clock_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Audio Session\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        m=audio 8000 RTP/AVP 0 96\r\n\
        a=rtpmap:0 PCMU/8000/1\r\n\
        a=rtpmap:96 L16/8000/1\r\n";

    #[test]
    fn parses_offer() {
        // ---
        let sdp = SessionDescription::parse(OFFER).expect("parse failed");

        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.session_name, "Audio Session");
        assert_eq!(sdp.media.len(), 1);
        assert_eq!(sdp.media[0].formats, vec![0, 96]);
        assert_eq!(sdp.media[0].rtpmap(96).unwrap().encoding, "L16");
        assert_eq!(
            sdp.audio_endpoint(),
            Some("127.0.0.1:8000".parse().unwrap())
        );
    }

    #[test]
    fn display_matches_wire_text() {
        // ---
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.to_string(), OFFER);
    }

    #[test]
    fn built_description_names_port_and_codecs() {
        // ---
        let config = CallConfig::default();
        let text = SessionDescription::for_endpoint(&config, 40000).to_string();

        assert!(text.contains("m=audio 40000 RTP/AVP 0 96\r\n"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000/1\r\n"));
        assert!(text.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(SessionDescription::parse(&text).is_ok());
    }

    #[test]
    fn missing_rtpmap_is_rejected() {
        // ---
        let text = OFFER.replace("a=rtpmap:96 L16/8000/1\r\n", "");
        assert!(matches!(
            SessionDescription::parse(&text),
            Err(CallError::MalformedSdp(_))
        ));
    }

    #[test]
    fn duplicate_rtpmap_is_rejected() {
        // ---
        let text = format!("{OFFER}a=rtpmap:0 PCMU/8000\r\n");
        assert!(SessionDescription::parse(&text).is_err());
    }

    #[test]
    fn session_and_media_attributes_are_separated() {
        // ---
        let text = OFFER.replace("t=0 0\r\n", "t=0 0\r\na=recvonly\r\n") + "a=ptime:20\r\n";
        let sdp = SessionDescription::parse(&text).unwrap();

        assert_eq!(sdp.attributes, vec!["recvonly".to_string()]);
        assert_eq!(sdp.media[0].attributes, vec!["ptime:20".to_string()]);
    }

    #[test]
    fn rtpmap_channels_default_to_one() {
        // ---
        let map = parse_rtpmap("0 PCMU/8000").unwrap();
        assert_eq!(map.channels, 1);
        assert!(parse_rtpmap("0 PCMU").is_err());
    }

    #[test]
    fn no_connection_means_no_endpoint() {
        // ---
        let text = OFFER.replace("c=IN IP4 127.0.0.1\r\n", "");
        let sdp = SessionDescription::parse(&text).unwrap();
        assert!(sdp.audio_endpoint().is_none());
    }
}
