use quick_xml::Reader;
use quick_xml::events::Event;

use crate::client::DavError;

/// Properties collected for one `<response>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PropSet {
    pub display_name: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub is_collection: bool,
}

impl PropSet {
    fn absorb(&mut self, other: PropSet) {
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        if other.content_length.is_some() {
            self.content_length = other.content_length;
        }
        if other.content_type.is_some() {
            self.content_type = other.content_type;
        }
        if other.last_modified.is_some() {
            self.last_modified = other.last_modified;
        }
        self.is_collection |= other.is_collection;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MultistatusEntry {
    pub href: String,
    pub props: PropSet,
}

#[derive(Default)]
struct ResponseState {
    href: Option<String>,
    props: PropSet,
}

#[derive(Default)]
struct PropstatState {
    props: PropSet,
    status: Option<String>,
}

/// Parses a `207 Multi-Status` body into one entry per `<response>`.
///
/// Element names are matched by local name so any namespace prefix works.
/// Properties from a `<propstat>` whose status is not 2xx are dropped.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<MultistatusEntry>, DavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut response: Option<ResponseState> = None;
    let mut propstat: Option<PropstatState> = None;
    let mut entries = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(e.local_name().as_ref());
                text.clear();
                match name.as_str() {
                    "response" => response = Some(ResponseState::default()),
                    "propstat" => propstat = Some(PropstatState::default()),
                    "collection" => mark_collection(&stack, propstat.as_mut()),
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(e.local_name().as_ref());
                if name == "collection" {
                    mark_collection(&stack, propstat.as_mut());
                }
            }
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(_) => {
                let Some(name) = stack.pop() else {
                    continue;
                };
                let parent = stack.last().map(String::as_str);
                let value = std::mem::take(&mut text);
                match name.as_str() {
                    "href" if parent == Some("response") => {
                        if let Some(state) = response.as_mut() {
                            state.href = Some(value);
                        }
                    }
                    "status" if parent == Some("propstat") => {
                        if let Some(state) = propstat.as_mut() {
                            state.status = Some(value);
                        }
                    }
                    "displayname" | "getcontentlength" | "getcontenttype" | "getlastmodified" => {
                        if let Some(state) = propstat.as_mut() {
                            apply_property(&mut state.props, &name, value);
                        }
                    }
                    "propstat" => {
                        if let (Some(done), Some(state)) = (propstat.take(), response.as_mut())
                            && status_is_success(done.status.as_deref())
                        {
                            state.props.absorb(done.props);
                        }
                    }
                    "response" => {
                        if let Some(state) = response.take()
                            && let Some(href) = state.href
                        {
                            entries.push(MultistatusEntry {
                                href,
                                props: state.props,
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn mark_collection(stack: &[String], propstat: Option<&mut PropstatState>) {
    if stack.last().map(String::as_str) == Some("resourcetype")
        && let Some(state) = propstat
    {
        state.props.is_collection = true;
    }
}

fn apply_property(props: &mut PropSet, name: &str, value: String) {
    let value = value.trim().to_string();
    if value.is_empty() {
        return;
    }
    match name {
        "displayname" => props.display_name = Some(value),
        "getcontentlength" => props.content_length = value.parse().ok(),
        "getcontenttype" => props.content_type = Some(value),
        "getlastmodified" => props.last_modified = Some(value),
        _ => {}
    }
}

// A propstat without a status line is taken at face value.
fn status_is_success(status: Option<&str>) -> bool {
    let Some(status) = status else {
        return true;
    };
    status
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code))
}
