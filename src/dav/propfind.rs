//! PROPFIND multistatus responses.
//!
//! The XML is assembled by hand; the property set is the small fixed one
//! WebDAV clients actually ask for (displayname, getcontentlength,
//! getcontenttype, getlastmodified, resourcetype).

use super::content_type_for;
use crate::manifest::Manifest;
use chrono::{TimeZone, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

// Everything a path segment must escape inside an href.
const HREF_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'?')
    .add(b'%')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone)]
pub struct DavResource {
    pub href: String,
    pub display_name: String,
    pub is_dir: bool,
    pub size: u64,
    pub content_type: Option<String>,
    pub modified: f64,
}

pub fn dir_resource(path: &str, modified: f64) -> DavResource {
    let href = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", utf8_percent_encode(path, HREF_SET))
    };
    let display_name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("/");
    DavResource {
        href,
        display_name: display_name.to_string(),
        is_dir: true,
        size: 0,
        content_type: None,
        modified,
    }
}

pub fn file_resource(manifest: &Manifest) -> DavResource {
    DavResource {
        href: utf8_percent_encode(&manifest.file_path, HREF_SET).to_string(),
        display_name: manifest.file_name.clone(),
        is_dir: false,
        size: manifest.file_size,
        content_type: Some(content_type_for(&manifest.file_path).to_string()),
        modified: manifest.created_at,
    }
}

/// RFC1123 date, as `getlastmodified` and `Last-Modified` want it.
pub fn http_date(unix: f64) -> String {
    let secs = if unix <= 0.0 { 0 } else { unix as i64 };
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(t) => t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        _ => "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
    }
}

pub fn multistatus(resources: &[DavResource]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str("<D:multistatus xmlns:D=\"DAV:\">\n");
    for resource in resources {
        xml.push_str("  <D:response>\n");
        xml.push_str(&format!("    <D:href>{}</D:href>\n", escape(&resource.href)));
        xml.push_str("    <D:propstat>\n      <D:prop>\n");
        xml.push_str(&format!(
            "        <D:displayname>{}</D:displayname>\n",
            escape(&resource.display_name)
        ));
        if resource.is_dir {
            xml.push_str("        <D:resourcetype><D:collection/></D:resourcetype>\n");
            xml.push_str("        <D:getcontenttype>httpd/unix-directory</D:getcontenttype>\n");
        } else {
            xml.push_str("        <D:resourcetype/>\n");
            xml.push_str(&format!(
                "        <D:getcontentlength>{}</D:getcontentlength>\n",
                resource.size
            ));
            if let Some(content_type) = &resource.content_type {
                xml.push_str(&format!(
                    "        <D:getcontenttype>{}</D:getcontenttype>\n",
                    escape(content_type)
                ));
            }
        }
        xml.push_str(&format!(
            "        <D:getlastmodified>{}</D:getlastmodified>\n",
            http_date(resource.modified)
        ));
        xml.push_str("      </D:prop>\n      <D:status>HTTP/1.1 200 OK</D:status>\n");
        xml.push_str("    </D:propstat>\n  </D:response>\n");
    }
    xml.push_str("</D:multistatus>\n");
    xml
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_is_rfc1123() {
        assert_eq!(http_date(0.0), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(http_date(1_700_000_000.0), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn multistatus_marks_collections() {
        let dir = dir_resource("/t", 0.0);
        let manifest = Manifest::new("/t/a.bin", 0, 100, Vec::new()).unwrap();
        let xml = multistatus(&[dir, file_resource(&manifest)]);
        assert!(xml.contains("<D:resourcetype><D:collection/></D:resourcetype>"));
        assert!(xml.contains("<D:getcontentlength>0</D:getcontentlength>"));
        assert!(xml.contains("<D:href>/t/</D:href>"));
        assert!(xml.contains("<D:href>/t/a.bin</D:href>"));
    }

    #[test]
    fn hrefs_are_percent_encoded() {
        let manifest = Manifest::new("/t/a file.bin", 0, 100, Vec::new()).unwrap();
        let resource = file_resource(&manifest);
        assert_eq!(resource.href, "/t/a%20file.bin");
    }
}
