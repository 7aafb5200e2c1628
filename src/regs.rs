//! Register descriptors and the target-description XML discovery that
//! populates them.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

/// `(name, index, size_bytes)` for a single register, as discovered from
/// the stub's target-description XML at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: String,
    pub index: u32,
    pub size_bytes: u32,
}

/// The full, immutable-after-discovery register set for a connected
/// target: an ordered list plus a name -> list-index map for O(1) lookup.
#[derive(Debug, Clone, Default)]
pub struct RegisterLayout {
    descriptors: Vec<RegisterDescriptor>,
    by_name: HashMap<String, usize>,
}

impl RegisterLayout {
    pub fn lookup(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn by_index(&self, index: u32) -> Option<&RegisterDescriptor> {
        self.descriptors.iter().find(|d| d.index == index)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Build a layout from a sequence of `<feature>` XML document bodies,
    /// in the order they should be walked. `regnum` attributes reset the
    /// running index; everything else is assigned sequentially.
    pub fn from_feature_xml<'a>(feature_docs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut descriptors = Vec::new();
        let mut by_name = HashMap::new();
        let mut next_index: u32 = 0;

        for doc in feature_docs {
            for (name, bitsize, regnum) in parse_regs(doc) {
                let index = regnum.unwrap_or(next_index);
                let size_bytes = bitsize / 8;
                by_name.insert(name.clone(), descriptors.len());
                descriptors.push(RegisterDescriptor {
                    name,
                    index,
                    size_bytes,
                });
                next_index = index + 1;
            }
        }

        RegisterLayout {
            descriptors,
            by_name,
        }
    }
}

/// Extract `(name, bitsize, regnum)` for every `<reg .../>` element in
/// `xml`, in document order.
fn parse_regs(xml: &str) -> Vec<(String, u32, Option<u32>)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;

    let mut out = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"reg" => {
                let mut name = None;
                let mut bitsize = None;
                let mut regnum = None;
                for attr in e.attributes().flatten() {
                    let value = attr.unescape_value().unwrap_or_default().into_owned();
                    match attr.key.as_ref() {
                        b"name" => name = Some(value),
                        b"bitsize" => bitsize = value.parse::<u32>().ok(),
                        b"regnum" => regnum = value.parse::<u32>().ok(),
                        _ => {}
                    }
                }
                if let (Some(name), Some(bitsize)) = (name, bitsize) {
                    out.push((name, bitsize, regnum));
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("malformed target-description XML: {e}");
                break;
            }
        }
        buf.clear();
    }

    out
}

/// Extract the `href` of every `<xi:include href="..."/>` in a
/// `target.xml` document. Non-namespaced XML parsers choke on the
/// unbound `xi:` prefix, so namespace prefixes are stripped from
/// `include` tags before parsing, matching the approach a minimal
/// client without full XML-namespace support has to take.
pub fn parse_xi_includes(xml: &str) -> Vec<String> {
    let stripped = xml.replace(":include", "");

    let mut reader = Reader::from_str(&stripped);
    reader.config_mut().trim_text = true;

    let mut hrefs = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"xi" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"href" {
                        hrefs.push(attr.unescape_value().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("malformed target.xml: {e}");
                break;
            }
        }
        buf.clear();
    }

    hrefs
}
