//! MANSCDP bodies: query parsing, catalog response and keepalive notify.
//!
//! Queries are deserialized with `quick-xml`; the root element is checked
//! first because the body of a `Notify` or `Response` has the same fields.
//! Outgoing bodies are small and fixed, so they are written from templates.

use std::fmt::Write;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Deserialize;

use crate::agent::DeviceConfig;

/// A platform query (`<Query>` root).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Query {
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
}

impl Query {
    /// Parse a query body. Returns `None` for anything that is not a
    /// `<Query>` document with a `CmdType`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let xml = String::from_utf8_lossy(body);
        let xml = xml.trim();
        if root_element(xml).as_deref() != Some("Query") {
            return None;
        }
        match quick_xml::de::from_str(xml) {
            Ok(query) => Some(query),
            Err(e) => {
                tracing::debug!(error = %e, "malformed MANSCDP query");
                None
            }
        }
    }

    pub fn is_catalog(&self) -> bool {
        self.cmd_type.eq_ignore_ascii_case("Catalog")
    }
}

/// Local name of the first element in `xml`.
fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Catalog `Response` listing every configured channel.
pub fn catalog_response(config: &DeviceConfig, sn: u32) -> String {
    let civil_code = config.device_id.get(..6).unwrap_or(&config.device_id);
    let count = config.channels.len();

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<Response>\r\n");
    let _ = write!(
        xml,
        "<CmdType>Catalog</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
         <SumNum>{count}</SumNum>\r\n<DeviceList Num=\"{count}\">\r\n",
        config.device_id
    );
    for (i, channel) in config.channels.iter().enumerate() {
        let _ = write!(
            xml,
            "<Item>\r\n<DeviceID>{channel}</DeviceID>\r\n<Name>{} {}</Name>\r\n\
             <Manufacturer>{}</Manufacturer>\r\n<Model>{}</Model>\r\n<Owner>Owner</Owner>\r\n\
             <CivilCode>{civil_code}</CivilCode>\r\n<Address>Address</Address>\r\n\
             <Parental>0</Parental>\r\n<ParentID>{}</ParentID>\r\n<SafetyWay>0</SafetyWay>\r\n\
             <RegisterWay>1</RegisterWay>\r\n<Secrecy>0</Secrecy>\r\n<Status>ON</Status>\r\n</Item>\r\n",
            config.device_name,
            i + 1,
            config.manufacturer,
            config.model,
            config.device_id,
        );
    }
    xml.push_str("</DeviceList>\r\n</Response>\r\n");
    xml
}

/// Keepalive `Notify` sent periodically to the platform.
pub fn keepalive_notify(device_id: &str, sn: u32) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n\
         <SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n"
    )
}
