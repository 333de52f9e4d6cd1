use std::fs;
use std::path::Path;

use log::info;

use crate::settings::{SmokeSettings, ViewerSettings};

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>zenoh camera viewer</title>
  <style>
    body { font-family: sans-serif; margin: 20px; background: #111; color: #eee; }
    h1 { font-size: 20px; }
    .panes { display: flex; flex-wrap: wrap; gap: 16px; }
    .pane { background: #1c1c1c; border-radius: 6px; padding: 10px; }
    .pane img { display: block; width: 640px; max-width: 100%; min-height: 120px; background: #000; }
    .stat { font-family: ui-monospace, Menlo, Consolas, monospace; font-size: 12px; margin-top: 6px; }
    .ok { color: #4ade80; }
    .err { color: #f87171; }
  </style>
</head>
<body>
  <h1>zenoh camera viewer</h1>
  <div class="panes">
    <div class="pane">
      <div><strong>RGB</strong> <span class="stat">__RGB_KEY__</span></div>
      <img id="rgb" alt="rgb frame" />
      <div id="rgb-status" class="stat">waiting…</div>
    </div>
    <div class="pane">
      <div><strong>Depth</strong> <span class="stat">__DEPTH_KEY__</span></div>
      <img id="depth" alt="depth frame" />
      <div id="depth-status" class="stat">waiting…</div>
    </div>
  </div>
  <script>
    const POLL_MS = __POLL_MS__;
    const sources = [
      { id: 'rgb', url: __RGB_URL__ },
      { id: 'depth', url: __DEPTH_URL__ },
    ];

    function show(source, ok, text) {
      const el = document.getElementById(source.id + '-status');
      el.className = 'stat ' + (ok ? 'ok' : 'err');
      el.textContent = text;
    }

    async function poll(source) {
      try {
        const resp = await fetch(source.url + '?t=' + Date.now(), { cache: 'no-store' });
        if (!resp.ok) {
          throw new Error('HTTP ' + resp.status);
        }
        const blob = await resp.blob();
        const img = document.getElementById(source.id);
        const previous = img.dataset.objectUrl;
        const next = URL.createObjectURL(blob);
        img.src = next;
        img.dataset.objectUrl = next;
        if (previous) {
          URL.revokeObjectURL(previous);
        }
        show(source, true, 'updated ' + new Date().toLocaleTimeString() + ' (' + blob.size + ' bytes)');
      } catch (err) {
        show(source, false, 'error: ' + err.message);
      }
    }

    function tick() {
      sources.forEach(poll);
    }

    tick();
    setInterval(tick, POLL_MS);
  </script>
</body>
</html>
"#;

fn endpoint(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

fn html_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// JS string literal safe to embed in a `<script>` block.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_owned())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

/// Render the self-contained viewer page polling the webserver plugin.
pub fn render(viewer: &ViewerSettings, smoke: &SmokeSettings) -> String {
    let rgb_url = endpoint(&smoke.webserver_url, &viewer.rgb_key);
    let depth_url = endpoint(&smoke.webserver_url, &viewer.depth_key);
    TEMPLATE
        .replace("__POLL_MS__", &viewer.poll_interval_ms.max(50).to_string())
        .replace("__RGB_URL__", &js_string(&rgb_url))
        .replace("__DEPTH_URL__", &js_string(&depth_url))
        .replace("__RGB_KEY__", &html_text(&viewer.rgb_key))
        .replace("__DEPTH_KEY__", &html_text(&viewer.depth_key))
}

pub fn write(path: &Path, html: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("unable to create viewer dir: {e}"))?;
    }
    fs::write(path, html).map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    info!("viewer: wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    #[test]
    fn embeds_both_endpoints_and_interval() {
        let settings = Settings::embedded().unwrap();
        let html = render(&settings.viewer, &settings.smoke);
        assert!(html.contains("url: \"http://localhost:8080/demo/zcam/rgb\""));
        assert!(html.contains("url: \"http://localhost:8080/demo/zcam/depth\""));
        assert!(html.contains("const POLL_MS = 500;"));
        assert!(html.contains("URL.revokeObjectURL(previous)"));
        assert!(!html.contains("__"));
    }

    #[test]
    fn clamps_interval_and_escapes_values() {
        let mut settings = Settings::embedded().unwrap();
        settings.viewer.poll_interval_ms = 0;
        settings.viewer.rgb_key = "/cam/a&b".into();
        settings.viewer.depth_key = "cam/</script>'x".into();
        settings.smoke.webserver_url = "http://router:9000/".into();
        let html = render(&settings.viewer, &settings.smoke);
        assert!(html.contains("const POLL_MS = 50;"));
        assert!(html.contains("url: \"http://router:9000/cam/a&b\""));
        assert!(html.contains("url: \"http://router:9000/cam/\\u003c/script\\u003e'x\""));
        assert_eq!(html.matches("</script>").count(), 1);
        assert!(html.contains(">/cam/a&amp;b</span>"));
        assert!(html.contains(">cam/&lt;/script&gt;&#39;x</span>"));
    }

    #[test]
    fn writes_page_creating_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer").join("index.html");
        write(&path, "<html></html>").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "<html></html>");
    }
}
