//! HTML directory listing for browsers.

use crate::manifest::Manifest;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

pub fn html_listing(path: &str, files: &[Manifest], subdirs: &[String]) -> String {
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>rclonepool — {path}</title>\n\
         <style>\n  body {{ font-family: monospace; padding: 20px; }}\n\
         table {{ border-collapse: collapse; }}\n\
         th, td {{ text-align: left; padding: 4px 16px; }}\n\
         .size {{ text-align: right; }}\n</style>\n</head>\n<body>\n\
         <h2>rclonepool — {path}</h2>\n<table>\n\
         <tr><th>Name</th><th class=\"size\">Size</th><th>Chunks</th><th>Remotes</th></tr>\n"
    );

    if path != "/" {
        let parent = match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(n) => path[..n].to_string(),
        };
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">..</a></td><td></td><td></td><td></td></tr>\n",
            encode_href(&parent)
        ));
    }
    for dir in subdirs {
        let full = if path == "/" {
            format!("/{dir}")
        } else {
            format!("{path}/{dir}")
        };
        html.push_str(&format!(
            "<tr><td><a href=\"{}/\">{dir}/</a></td><td></td><td></td><td></td></tr>\n",
            encode_href(&full)
        ));
    }
    for manifest in files {
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td class=\"size\">{}</td><td>{}</td><td>{}</td></tr>\n",
            encode_href(&manifest.file_path),
            manifest.file_name,
            human_size(manifest.file_size),
            manifest.chunk_count,
            manifest.remotes().join(", ")
        ));
    }

    html.push_str("</table>\n<hr>\n<p>rclonepool WebDAV server · <a href=\"/\">home</a></p>\n</body></html>\n");
    html
}

fn encode_href(path: &str) -> String {
    path.split('/')
        .map(|seg| utf8_percent_encode(seg, NON_ALPHANUMERIC).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn human_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_scale_through_units() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn listing_links_files_and_dirs() {
        let manifest = Manifest::new("/t/a.bin", 0, 100, Vec::new()).unwrap();
        let html = html_listing("/t", &[manifest], &["sub".to_string()]);
        assert!(html.contains("href=\"/t/a%2Ebin\""));
        assert!(html.contains("href=\"/t/sub/\""));
        assert!(html.contains("href=\"/\"")); // parent link
    }
}
