//! XML feed parser
//!
//! Streams records out of a (possibly bzip2-compressed) XML feed. Each
//! occurrence of the record element becomes one entity; attributes of the
//! element and its descendants, plus the text of leaf children, are
//! collected by name.

use bzip2::read::BzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::{FeedError, FeedParser, RecordStream};
use crate::config::FeedConfig;
use crate::types::EntityRecord;

/// Names of the element and fields that make up a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLayout {
    pub record_element: String,
    pub id_attribute: String,
    pub name_attribute: String,
    pub date_attribute: String,
    pub reference_attribute: String,
}

impl From<&FeedConfig> for FeedLayout {
    fn from(config: &FeedConfig) -> Self {
        Self {
            record_element: config.record_element.clone(),
            id_attribute: config.id_attribute.clone(),
            name_attribute: config.name_attribute.clone(),
            date_attribute: config.date_attribute.clone(),
            reference_attribute: config.reference_attribute.clone(),
        }
    }
}

/// [`FeedParser`] for XML feeds
#[derive(Debug, Clone)]
pub struct XmlFeedParser {
    layout: FeedLayout,
}

impl XmlFeedParser {
    pub fn new(layout: FeedLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FeedLayout {
        &self.layout
    }
}

impl FeedParser for XmlFeedParser {
    fn parse(&self, path: &Path) -> Result<RecordStream, FeedError> {
        let reader = FeedReader::open(path)?;
        tracing::debug!("Opened feed {}", path.display());
        Ok(Box::new(RecordIter {
            reader,
            layout: self.layout.clone(),
            done: false,
        }))
    }
}

/// Reader abstraction for different compression formats
enum FeedReader {
    Bzip2(Reader<BufReader<BzDecoder<File>>>),
    Plain(Reader<BufReader<File>>),
}

impl FeedReader {
    fn open(path: &Path) -> Result<Self, FeedError> {
        let is_bz2 = path.extension().map(|e| e == "bz2").unwrap_or(false) || has_bzip2_magic(path)?;
        let file = File::open(path)?;

        Ok(if is_bz2 {
            let decoder = BzDecoder::new(file);
            FeedReader::Bzip2(Reader::from_reader(BufReader::with_capacity(1024 * 1024, decoder)))
        } else {
            FeedReader::Plain(Reader::from_reader(BufReader::with_capacity(1024 * 1024, file)))
        })
    }

    fn read_event<'a>(&mut self, buf: &'a mut Vec<u8>) -> Result<Event<'a>, quick_xml::Error> {
        buf.clear();
        match self {
            FeedReader::Bzip2(reader) => reader.read_event_into(buf),
            FeedReader::Plain(reader) => reader.read_event_into(buf),
        }
    }

    fn position(&self) -> u64 {
        match self {
            FeedReader::Bzip2(reader) => reader.buffer_position() as u64,
            FeedReader::Plain(reader) => reader.buffer_position() as u64,
        }
    }
}

fn has_bzip2_magic(path: &Path) -> Result<bool, FeedError> {
    let mut magic = [0u8; 3];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 3 && &magic == b"BZh")
}

/// Fields gathered while inside one record element
#[derive(Debug, Default)]
struct PartialRecord {
    fields: BTreeMap<String, String>,
    depth: usize,
    leaf: Option<String>,
    text: String,
}

impl PartialRecord {
    fn absorb_attributes(&mut self, element: &BytesStart<'_>) -> Result<(), String> {
        for attr in element.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            // Outer elements win on name clashes
            self.fields
                .entry(key)
                .or_insert_with(|| value.trim().to_string());
        }
        Ok(())
    }
}

struct RecordIter {
    reader: FeedReader,
    layout: FeedLayout,
    done: bool,
}

impl RecordIter {
    fn xml_error(&self, message: impl ToString) -> FeedError {
        FeedError::Xml {
            position: self.reader.position(),
            message: message.to_string(),
        }
    }

    fn next_record(&mut self) -> Result<Option<EntityRecord>, FeedError> {
        let mut buf = Vec::with_capacity(4096);
        let mut current: Option<PartialRecord> = None;

        loop {
            let event = match self.reader.read_event(&mut buf) {
                Ok(event) => event,
                Err(e) => return Err(self.xml_error(e)),
            };

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                    if let Some(record) = current.as_mut() {
                        if let Err(msg) = record.absorb_attributes(e) {
                            return Err(self.xml_error(msg));
                        }
                        if !is_empty {
                            record.depth += 1;
                            record.leaf = Some(name);
                            record.text.clear();
                        }
                    } else if name == self.layout.record_element {
                        let mut record = PartialRecord::default();
                        if let Err(msg) = record.absorb_attributes(e) {
                            return Err(self.xml_error(msg));
                        }
                        if is_empty {
                            return self.finish(record).map(Some);
                        }
                        record.depth = 1;
                        current = Some(record);
                    }
                }
                Event::Text(ref e) => {
                    if let Some(record) = current.as_mut().filter(|r| r.leaf.is_some()) {
                        if let Ok(text) = e.unescape() {
                            record.text.push_str(&text);
                        }
                    }
                }
                Event::CData(ref e) => {
                    if let Some(record) = current.as_mut().filter(|r| r.leaf.is_some()) {
                        record.text.push_str(&String::from_utf8_lossy(&e.to_vec()));
                    }
                }
                Event::End(ref e) => {
                    if let Some(mut record) = current.take() {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                        if record.leaf.as_deref() == Some(name.as_str()) {
                            let text = record.text.trim().to_string();
                            if !text.is_empty() {
                                record.fields.entry(name).or_insert(text);
                            }
                        }
                        record.leaf = None;
                        record.depth -= 1;

                        if record.depth == 0 {
                            return self.finish(record).map(Some);
                        }
                        current = Some(record);
                    }
                }
                Event::Eof => {
                    if current.is_some() {
                        return Err(self.xml_error("feed ended inside a record"));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn finish(&self, record: PartialRecord) -> Result<EntityRecord, FeedError> {
        let mut fields = record.fields;
        let layout = &self.layout;

        let id = fields
            .remove(&layout.id_attribute)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FeedError::MissingId {
                position: self.reader.position(),
                attribute: layout.id_attribute.clone(),
            })?;

        let mut entity = EntityRecord::new(id, fields.remove(&layout.name_attribute).unwrap_or_default());
        entity.filing_date = fields.remove(&layout.date_attribute).filter(|d| !d.is_empty());
        entity.reference = fields.remove(&layout.reference_attribute).filter(|r| !r.is_empty());
        entity.attributes = fields;
        Ok(entity)
    }
}

impl Iterator for RecordIter {
    type Item = Result<EntityRecord, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                if e.is_fatal() {
                    self.done = true;
                }
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Firms>
  <Firm FirmCrdNb="100" BusNm="Acme Advisers &amp; Co" FilingDt="01/15/2024" BrochureId="884512">
    <MainAddr City="Boston" State="MA"/>
    <Website>https://acme.example.com</Website>
  </Firm>
  <Firm FirmCrdNb="200" BusNm="Beta Capital"/>
  <Firm BusNm="No Id Partners"/>
  <Firm>
    <FirmCrdNb>300</FirmCrdNb>
    <BusNm><![CDATA[Gamma & Sons]]></BusNm>
    <FilingDt> 2/3/2024 </FilingDt>
  </Firm>
</Firms>
"#;

    fn parser() -> XmlFeedParser {
        XmlFeedParser::new(FeedLayout::from(&FeedConfig::default()))
    }

    fn collect(path: &Path) -> Vec<Result<EntityRecord, FeedError>> {
        parser().parse(path).unwrap().collect()
    }

    fn check_records(results: Vec<Result<EntityRecord, FeedError>>) {
        assert_eq!(results.len(), 4);

        let acme = results[0].as_ref().unwrap();
        assert_eq!(acme.id, "100");
        assert_eq!(acme.name, "Acme Advisers & Co");
        assert_eq!(acme.filing_date.as_deref(), Some("01/15/2024"));
        assert_eq!(acme.reference.as_deref(), Some("884512"));
        assert_eq!(acme.attribute("City"), Some("Boston"));
        assert_eq!(acme.attribute("State"), Some("MA"));
        assert_eq!(acme.attribute("Website"), Some("https://acme.example.com"));

        let beta = results[1].as_ref().unwrap();
        assert_eq!(beta.id, "200");
        assert!(beta.filing_date.is_none());
        assert!(beta.reference.is_none());

        let missing = results[2].as_ref().unwrap_err();
        assert!(matches!(missing, FeedError::MissingId { .. }));
        assert!(!missing.is_fatal());

        let gamma = results[3].as_ref().unwrap();
        assert_eq!(gamma.id, "300");
        assert_eq!(gamma.name, "Gamma & Sons");
        assert_eq!(gamma.filing_date.as_deref(), Some("2/3/2024"));
    }

    #[test]
    fn test_parse_plain_feed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(&path, FEED).unwrap();

        check_records(collect(&path));
    }

    #[test]
    fn test_parse_bzip2_feed() {
        let dir = TempDir::new().unwrap();
        // No .bz2 extension: detection falls back to the magic bytes
        let path = dir.path().join("feed.dat");

        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(FEED.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        check_records(collect(&path));
    }

    #[test]
    fn test_truncated_feed_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(&path, "<Firms><Firm FirmCrdNb=\"1\"/><Firm FirmCrdNb=\"2\">").unwrap();

        let results = collect(&path);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().id, "1");
        assert!(results[1].as_ref().unwrap_err().is_fatal());
    }

    #[test]
    fn test_missing_file() {
        let err = parser().parse(Path::new("/nonexistent/feed.xml")).err().unwrap();
        assert!(matches!(err, FeedError::Io(_)));
    }
}
