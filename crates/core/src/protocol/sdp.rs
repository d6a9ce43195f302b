//! SDP (Session Description Protocol) parsing (RFC 4566 / RFC 8866).
//!
//! Cameras advertise their media in the `x-sdp` handshake header. A
//! typical description:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- 0 0 IN IP4 10.0.0.12                     ← origin
//! s=Camera                                     ← session name
//! t=0 0                                        ← timing (live stream)
//! m=video 0 RTP/AVP 96                         ← media description
//! b=AS:1024                                    ← bandwidth (kbps)
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAH5WoFAFuQA==,aM48gA==
//! a=framerate:15                               ← frames per second
//! a=x-dimensions:1280,720                      ← picture size
//! m=audio 0 RTP/AVP 0
//! a=rtpmap:0 PCMU/8000
//! ```
//!
//! Parsing never fails as a whole: malformed lines are logged and
//! skipped, so a single bad attribute does not cost the recording.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::media::sps;

/// Bandwidth line (`b=<type>:<value>`) of a media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bandwidth {
    /// Modifier, lowercased (e.g. `as`, `tias`).
    pub kind: String,
    pub value: u32,
}

/// Encoding from `a=rtpmap:<fmt> <name>/<clock>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub name: String,
    pub clock_rate: u32,
}

/// One `m=` section and the attributes that followed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    /// Media type (`video`, `audio`, ...).
    pub kind: String,
    pub port: String,
    pub protocol: String,
    /// First payload format listed on the `m=` line.
    pub format: String,
    pub bandwidth: Option<Bandwidth>,
    pub encoding: Option<Encoding>,
    pub framerate: Option<f64>,
    /// `(width, height)` from `a=x-dimensions` or the SPS in `sprop-parameter-sets`.
    pub resolution: Option<(u32, u32)>,
    /// `a=fmtp` parameters, split on `;` and trimmed.
    pub format_parameters: Vec<String>,
}

impl Media {
    fn new(kind: &str, port: &str, protocol: &str, format: &str) -> Self {
        Self {
            kind: kind.to_string(),
            port: port.to_string(),
            protocol: protocol.to_string(),
            format: format.to_string(),
            bandwidth: None,
            encoding: None,
            framerate: None,
            resolution: None,
            format_parameters: Vec::new(),
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == "video"
    }

    pub fn is_audio(&self) -> bool {
        self.kind == "audio"
    }

    /// Encoding name from `a=rtpmap`, or an empty string if absent.
    pub fn encoding_name(&self) -> &str {
        self.encoding.as_ref().map(|e| e.name.as_str()).unwrap_or("")
    }

    /// RTP payload type of this media section, if the format is numeric.
    pub fn payload_type(&self) -> Option<u8> {
        self.format.parse().ok()
    }

    /// Look up a format parameter by key (case-insensitive).
    pub fn format_parameter(&self, key: &str) -> Option<&str> {
        self.format_parameters.iter().find_map(|p| {
            let (k, v) = p.split_once('=')?;
            k.trim().eq_ignore_ascii_case(key).then_some(v.trim())
        })
    }

    /// Decoded `sprop-parameter-sets` (SPS first, then PPS).
    ///
    /// Entries that fail to decode are logged and skipped.
    pub fn parameter_sets(&self) -> Vec<Vec<u8>> {
        let Some(sprops) = self.format_parameter("sprop-parameter-sets") else {
            return Vec::new();
        };
        sprops
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| match BASE64_STANDARD.decode(s.trim()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode sprop-parameter-set");
                    None
                }
            })
            .collect()
    }
}

/// A parsed session description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescription {
    /// Session-level `<type>=<value>` lines other than `m`, `b` and `a`.
    pub fields: Vec<(char, String)>,
    /// Session-level attributes (keys lowercased).
    pub attributes: Vec<(String, String)>,
    pub media: Vec<Media>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Self {
        let mut sdp = SessionDescription::default();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let (name, value) = match line.as_bytes() {
                [n, b'=', ..] if n.is_ascii_alphabetic() => (*n as char, &line[2..]),
                _ => {
                    if !line.trim().is_empty() {
                        tracing::trace!(line, "skipping non-SDP line");
                    }
                    continue;
                }
            };

            let parsed = match name {
                'm' => sdp.parse_media(value),
                'b' => sdp.parse_bandwidth(value),
                'a' => sdp.parse_attribute(value),
                _ => {
                    sdp.fields.push((name, value.to_string()));
                    Ok(())
                }
            };
            if let Err(reason) = parsed {
                tracing::warn!(line, reason, "error parsing sdp line");
            }
        }

        for media in &mut sdp.media {
            if media.resolution.is_none() {
                media.resolution = media
                    .parameter_sets()
                    .first()
                    .and_then(|nal| sps::parse_sps(nal))
                    .map(|info| (info.width, info.height));
            }
        }

        sdp
    }

    /// Session-level field value (e.g. `'s'` for the session name).
    pub fn field(&self, name: char) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Session-level attribute by (lowercase) key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn video(&self) -> impl Iterator<Item = &Media> {
        self.media.iter().filter(|m| m.is_video())
    }

    pub fn audio(&self) -> impl Iterator<Item = &Media> {
        self.media.iter().filter(|m| m.is_audio())
    }

    fn parse_media(&mut self, value: &str) -> Result<(), &'static str> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 4 {
            return Err("media line needs type, port, protocol and format");
        }
        let media = Media::new(parts[0], parts[1], parts[2], parts[3]);
        tracing::trace!(?media, "parsed media descriptor");
        self.media.push(media);
        Ok(())
    }

    fn parse_bandwidth(&mut self, value: &str) -> Result<(), &'static str> {
        let Some(media) = self.media.last_mut() else {
            return Err("bandwidth without preceding media");
        };
        let (kind, bw) = value.split_once(':').ok_or("bandwidth missing ':'")?;
        let value = bw.trim().parse().map_err(|_| "bandwidth is not a number")?;
        media.bandwidth = Some(Bandwidth {
            kind: kind.trim().to_ascii_lowercase(),
            value,
        });
        Ok(())
    }

    fn parse_attribute(&mut self, value: &str) -> Result<(), &'static str> {
        let (key, val) = match value.split_once(':') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
            None => (value.trim().to_ascii_lowercase(), ""),
        };

        match key.as_str() {
            "rtpmap" => self.parse_rtpmap(val),
            "fmtp" => self.parse_fmtp(val),
            "framerate" | "x-framerate" => {
                let media = self.media.last_mut().ok_or("framerate without media")?;
                media.framerate = Some(val.parse().map_err(|_| "framerate is not a number")?);
                Ok(())
            }
            "x-dimensions" => {
                let media = self.media.last_mut().ok_or("dimensions without media")?;
                let (w, h) = val.split_once(',').ok_or("dimensions missing ','")?;
                let w = w.trim().parse().map_err(|_| "bad width")?;
                let h = h.trim().parse().map_err(|_| "bad height")?;
                media.resolution = Some((w, h));
                Ok(())
            }
            _ => {
                if self.media.is_empty() {
                    self.attributes.push((key, val.to_string()));
                } else {
                    tracing::trace!(attribute = value, "ignoring media attribute");
                }
                Ok(())
            }
        }
    }

    fn parse_rtpmap(&mut self, value: &str) -> Result<(), &'static str> {
        let (format, encoding) = value
            .split_once(char::is_whitespace)
            .ok_or("rtpmap missing encoding")?;
        let mut parts = encoding.trim().split('/');
        let name = parts.next().ok_or("rtpmap missing name")?;
        let clock_rate = parts
            .next()
            .ok_or("rtpmap missing clock rate")?
            .trim()
            .parse()
            .map_err(|_| "rtpmap clock rate is not a number")?;

        for media in self.media.iter_mut().filter(|m| m.format == format) {
            media.encoding = Some(Encoding {
                name: name.to_string(),
                clock_rate,
            });
        }
        Ok(())
    }

    fn parse_fmtp(&mut self, value: &str) -> Result<(), &'static str> {
        let (format, params) = value
            .split_once(char::is_whitespace)
            .ok_or("fmtp missing parameters")?;
        let params: Vec<String> = params
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        for media in self.media.iter_mut().filter(|m| m.format == format) {
            media.format_parameters = params.clone();
        }
        Ok(())
    }
}
