// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP binary encoding (RFC 8010 SS3): constants, request parser, and
// response builder.
//
// The parser only covers the attribute section.  Document data follows the
// end-of-attributes tag and is streamed by the caller straight to the spool,
// so `IppRequest` records where the attribute section ended instead of
// carrying the document.

use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// IPP version 1.1 major byte (used in responses).
pub const IPP_VERSION_MAJOR: u8 = 0x01;

/// IPP version 1.1 minor byte.
pub const IPP_VERSION_MINOR: u8 = 0x01;

// ---------------------------------------------------------------------------
// IPP delimiter tags (RFC 8010 SS3.5.1)
// ---------------------------------------------------------------------------

/// Operation attributes group delimiter.
pub const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;

/// Job attributes group delimiter.
pub const TAG_JOB_ATTRIBUTES: u8 = 0x02;

/// End-of-attributes-tag -- terminates the attribute section.
pub const TAG_END_OF_ATTRIBUTES: u8 = 0x03;

/// Printer attributes group delimiter.
pub const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;

/// Unsupported attributes group delimiter.
pub const TAG_UNSUPPORTED_ATTRIBUTES: u8 = 0x05;

// ---------------------------------------------------------------------------
// IPP value tags (RFC 8010 SS3.5.2)
// ---------------------------------------------------------------------------

/// Out-of-band `no-value` (zero-length value).
pub const VALUE_TAG_NO_VALUE: u8 = 0x13;

/// Integer value (4 bytes, signed big-endian).
pub const VALUE_TAG_INTEGER: u8 = 0x21;

/// Boolean value (1 byte: 0x00 = false, 0x01 = true).
pub const VALUE_TAG_BOOLEAN: u8 = 0x22;

/// Enum value (4 bytes, same encoding as integer).
pub const VALUE_TAG_ENUM: u8 = 0x23;

/// textWithoutLanguage (UTF-8 string).
pub const VALUE_TAG_TEXT: u8 = 0x41;

/// nameWithoutLanguage (UTF-8 string).
pub const VALUE_TAG_NAME: u8 = 0x42;

/// keyword (US-ASCII string).
pub const VALUE_TAG_KEYWORD: u8 = 0x44;

/// uri (US-ASCII string).
pub const VALUE_TAG_URI: u8 = 0x45;

/// charset (US-ASCII string, e.g. "utf-8").
pub const VALUE_TAG_CHARSET: u8 = 0x47;

/// naturalLanguage (US-ASCII string, e.g. "en").
pub const VALUE_TAG_NATURAL_LANGUAGE: u8 = 0x48;

/// mimeMediaType (US-ASCII string).
pub const VALUE_TAG_MIME_MEDIA_TYPE: u8 = 0x49;

// ---------------------------------------------------------------------------
// IPP operation IDs (RFC 8011 SS4)
// ---------------------------------------------------------------------------

pub const OP_PRINT_JOB: u16 = 0x0002;
pub const OP_VALIDATE_JOB: u16 = 0x0004;
pub const OP_CANCEL_JOB: u16 = 0x0008;
pub const OP_GET_JOB_ATTRIBUTES: u16 = 0x0009;
pub const OP_GET_JOBS: u16 = 0x000A;
pub const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000B;

// ---------------------------------------------------------------------------
// IPP status codes (RFC 8011 SS4.1.8)
// ---------------------------------------------------------------------------

pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_CLIENT_ERROR_BAD_REQUEST: u16 = 0x0400;
pub const STATUS_CLIENT_ERROR_FORBIDDEN: u16 = 0x0401;
pub const STATUS_CLIENT_ERROR_NOT_AUTHENTICATED: u16 = 0x0402;
pub const STATUS_CLIENT_ERROR_NOT_POSSIBLE: u16 = 0x0404;
pub const STATUS_CLIENT_ERROR_NOT_FOUND: u16 = 0x0406;
pub const STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE: u16 = 0x0409;
pub const STATUS_CLIENT_ERROR_DOCUMENT_FORMAT_NOT_SUPPORTED: u16 = 0x040A;
pub const STATUS_CLIENT_ERROR_ATTRIBUTES_OR_VALUES_NOT_SUPPORTED: u16 = 0x040B;
pub const STATUS_SERVER_ERROR_INTERNAL: u16 = 0x0500;
pub const STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED: u16 = 0x0501;
pub const STATUS_SERVER_ERROR_VERSION_NOT_SUPPORTED: u16 = 0x0503;
pub const STATUS_SERVER_ERROR_BUSY: u16 = 0x0507;

// ---------------------------------------------------------------------------
// IPP job-state values (RFC 8011 SS5.3.7)
// ---------------------------------------------------------------------------

pub const JOB_STATE_PENDING: i32 = 3;
pub const JOB_STATE_PROCESSING: i32 = 5;
pub const JOB_STATE_CANCELED: i32 = 7;
pub const JOB_STATE_ABORTED: i32 = 8;
pub const JOB_STATE_COMPLETED: i32 = 9;

// ---------------------------------------------------------------------------
// IPP printer-state values (RFC 8011 SS5.4.11)
// ---------------------------------------------------------------------------

pub const PRINTER_STATE_IDLE: i32 = 3;
pub const PRINTER_STATE_PROCESSING: i32 = 4;

// ---------------------------------------------------------------------------
// Parsed IPP request
// ---------------------------------------------------------------------------

/// Why an attribute section could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The data ends before the end-of-attributes tag; more may follow.
    #[error("attribute section incomplete")]
    Incomplete,
    #[error("{0}")]
    Malformed(String),
}

/// A single parsed IPP attribute.
#[derive(Debug, Clone)]
pub struct IppAttribute {
    pub value_tag: u8,
    /// Attribute name (empty for additional values in a 1setOf).
    pub name: String,
    pub value: Vec<u8>,
}

/// A group of attributes delimited by a group tag.
#[derive(Debug, Clone)]
pub struct IppAttributeGroup {
    /// The delimiter tag for this group (0x01, 0x02, 0x04, etc.)
    pub delimiter: u8,
    pub attributes: Vec<IppAttribute>,
}

impl IppAttributeGroup {
    /// Find the first attribute with the given name.
    pub fn get(&self, name: &str) -> Option<&IppAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Read the first attribute with the given name as a UTF-8 string.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|a| String::from_utf8(a.value.clone()).ok())
    }

    /// Read the first attribute with the given name as an i32 integer.
    pub fn get_integer(&self, name: &str) -> Option<i32> {
        self.get(name).and_then(|a| {
            <[u8; 4]>::try_from(a.value.as_slice())
                .ok()
                .map(i32::from_be_bytes)
        })
    }
}

/// A parsed IPP request header and attribute section.
#[derive(Debug)]
pub struct IppRequest {
    pub version_major: u8,
    pub version_minor: u8,
    /// The operation identifier (status-code when parsing a response).
    pub operation_id: u16,
    /// Echoed back in the response.
    pub request_id: u32,
    pub attribute_groups: Vec<IppAttributeGroup>,
    /// Offset of the first document byte, just past the end-of-attributes tag.
    pub body_offset: usize,
}

impl IppRequest {
    /// The first operation-attributes group.
    pub fn operation_attributes(&self) -> Option<&IppAttributeGroup> {
        self.group(TAG_OPERATION_ATTRIBUTES)
    }

    /// The first job-attributes group.
    pub fn job_attributes(&self) -> Option<&IppAttributeGroup> {
        self.group(TAG_JOB_ATTRIBUTES)
    }

    pub fn group(&self, delimiter: u8) -> Option<&IppAttributeGroup> {
        self.attribute_groups
            .iter()
            .find(|g| g.delimiter == delimiter)
    }
}

// ---------------------------------------------------------------------------
// IPP binary parser
// ---------------------------------------------------------------------------

/// Parse the header and attribute section of an IPP message.
///
/// ```text
/// version-number:  2 bytes (major, minor)
/// operation-id:    2 bytes (big-endian u16)
/// request-id:      4 bytes (big-endian u32)
/// attribute-groups: variable
///   delimiter-tag: 1 byte
///   attributes:    variable
///     value-tag:    1 byte
///     name-length:  2 bytes (big-endian u16)
///     name:         name-length bytes
///     value-length: 2 bytes (big-endian u16)
///     value:        value-length bytes
/// end-of-attributes-tag: 1 byte (0x03)
/// document-data: remainder
/// ```
///
/// Returns `CodecError::Incomplete` if `data` stops before the
/// end-of-attributes tag, so a streaming caller can read more and retry.
pub fn parse_ipp_request(data: &[u8]) -> Result<IppRequest, CodecError> {
    if data.len() < 8 {
        return Err(CodecError::Incomplete);
    }

    let version_major = data[0];
    let version_minor = data[1];
    let operation_id = u16::from_be_bytes([data[2], data[3]]);
    let request_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    let mut pos = 8;
    let mut attribute_groups: Vec<IppAttributeGroup> = Vec::new();
    let mut current_group: Option<IppAttributeGroup> = None;

    loop {
        let Some(&tag) = data.get(pos) else {
            return Err(CodecError::Incomplete);
        };

        // Delimiter tags are in the range 0x00..=0x0F.
        if tag <= 0x0F {
            if let Some(group) = current_group.take() {
                attribute_groups.push(group);
            }
            pos += 1;

            if tag == TAG_END_OF_ATTRIBUTES {
                break;
            }
            if tag == 0x00 {
                return Err(CodecError::Malformed("reserved delimiter tag 0x00".into()));
            }
            current_group = Some(IppAttributeGroup {
                delimiter: tag,
                attributes: Vec::new(),
            });
            continue;
        }

        let value_tag = tag;
        pos += 1;

        let name_length = read_u16(data, pos)? as usize;
        pos += 2;
        let name_bytes = data
            .get(pos..pos + name_length)
            .ok_or(CodecError::Incomplete)?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| CodecError::Malformed("attribute name is not UTF-8".into()))?;
        pos += name_length;

        let value_length = read_u16(data, pos)? as usize;
        pos += 2;
        let value = data
            .get(pos..pos + value_length)
            .ok_or(CodecError::Incomplete)?
            .to_vec();
        pos += value_length;

        let attr = IppAttribute {
            value_tag,
            name,
            value,
        };

        match current_group.as_mut() {
            Some(group) => group.attributes.push(attr),
            None => {
                warn!(name = %attr.name, "IPP attribute outside of any group");
                return Err(CodecError::Malformed(
                    "attribute appears before any group delimiter".into(),
                ));
            }
        }
    }

    Ok(IppRequest {
        version_major,
        version_minor,
        operation_id,
        request_id,
        attribute_groups,
        body_offset: pos,
    })
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, CodecError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(CodecError::Incomplete)
}

// ---------------------------------------------------------------------------
// IPP binary response builder
// ---------------------------------------------------------------------------

/// Builder for IPP response messages (RFC 8010 SS3.4).
pub struct IppResponseBuilder {
    buf: Vec<u8>,
}

impl IppResponseBuilder {
    /// Start a response with the given status code and request-id.
    pub fn new(status_code: u16, request_id: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.push(IPP_VERSION_MAJOR);
        buf.push(IPP_VERSION_MINOR);
        buf.extend_from_slice(&status_code.to_be_bytes());
        buf.extend_from_slice(&request_id.to_be_bytes());
        Self { buf }
    }

    /// Start a response and write the operation-attributes group every
    /// response begins with.
    pub fn with_operation_attributes(status_code: u16, request_id: u32, message: &str) -> Self {
        let mut resp = Self::new(status_code, request_id);
        resp.begin_group(TAG_OPERATION_ATTRIBUTES)
            .charset("attributes-charset", "utf-8")
            .natural_language("attributes-natural-language", "en")
            .text("status-message", message);
        resp
    }

    /// Start a new attribute group.
    pub fn begin_group(&mut self, delimiter: u8) -> &mut Self {
        self.buf.push(delimiter);
        self
    }

    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_TEXT, name, value.as_bytes())
    }

    pub fn name_attr(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_NAME, name, value.as_bytes())
    }

    pub fn keyword(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_KEYWORD, name, value.as_bytes())
    }

    /// Additional value of a 1setOf keyword (name-length = 0, RFC 8010 SS3.1.4).
    pub fn keyword_additional(&mut self, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_KEYWORD, "", value.as_bytes())
    }

    pub fn mime_type(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_MIME_MEDIA_TYPE, name, value.as_bytes())
    }

    pub fn mime_type_additional(&mut self, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_MIME_MEDIA_TYPE, "", value.as_bytes())
    }

    pub fn uri(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_URI, name, value.as_bytes())
    }

    pub fn charset(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_CHARSET, name, value.as_bytes())
    }

    pub fn natural_language(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_NATURAL_LANGUAGE, name, value.as_bytes())
    }

    pub fn integer(&mut self, name: &str, value: i32) -> &mut Self {
        self.write_attr(VALUE_TAG_INTEGER, name, &value.to_be_bytes())
    }

    pub fn enum_attr(&mut self, name: &str, value: i32) -> &mut Self {
        self.write_attr(VALUE_TAG_ENUM, name, &value.to_be_bytes())
    }

    pub fn enum_additional(&mut self, value: i32) -> &mut Self {
        self.write_attr(VALUE_TAG_ENUM, "", &value.to_be_bytes())
    }

    pub fn no_value(&mut self, name: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_NO_VALUE, name, &[])
    }

    pub fn boolean(&mut self, name: &str, value: bool) -> &mut Self {
        self.write_attr(VALUE_TAG_BOOLEAN, name, &[u8::from(value)])
    }

    /// Write a raw attribute.  Names and values longer than the 16-bit length
    /// field allows are truncated.
    pub fn write_attr(&mut self, value_tag: u8, name: &str, value: &[u8]) -> &mut Self {
        let name = &name.as_bytes()[..name.len().min(u16::MAX as usize)];
        let value = &value[..value.len().min(u16::MAX as usize)];
        self.buf.push(value_tag);
        self.buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(name);
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Write the end-of-attributes tag and return the bytes.
    pub fn build(mut self) -> Vec<u8> {
        self.buf.push(TAG_END_OF_ATTRIBUTES);
        self.buf
    }
}

/// A response carrying only operation attributes.
pub fn build_error_response(status: u16, request_id: u32, message: &str) -> Vec<u8> {
    IppResponseBuilder::with_operation_attributes(status, request_id, message).build()
}
