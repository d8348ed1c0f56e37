//! `/dashboard` page: a map of camera locations with links to their streams.

pub const MAP_JS_CDN: &str = "https://openlayers.org/en/v4.6.5/build/ol.js";
pub const MAP_CSS_CDN: &str = "https://openlayers.org/en/v4.6.5/css/ol.css";

/// Render the page with `config` (the public camera view) embedded as JSON.
pub fn render(config: &serde_json::Value) -> String {
    // `</script>` inside a string literal would end the script block.
    let json = config.to_string().replace("</", "<\\/");
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Dashboard</title>
<link rel="stylesheet" href="{css}">
<script src="{js}"></script>
<style>
html, body, #map {{ margin: 0; width: 100%; height: 100%; }}
#popup {{ background: #fff; padding: 6px; border-radius: 4px; }}
</style>
</head>
<body>
<div id="map"></div>
<div id="popup"></div>
<script>
const CONFIG = {json};
const features = CONFIG.cameras.map(function (cam, idx) {{
  const f = new ol.Feature({{ geometry: new ol.geom.Point(ol.proj.fromLonLat([cam.longitude, cam.latitude])) }});
  f.set("address", cam.address);
  f.set("stream", "/camera/" + idx);
  return f;
}});
const map = new ol.Map({{
  target: "map",
  layers: [
    new ol.layer.Tile({{ source: new ol.source.OSM() }}),
    new ol.layer.Vector({{ source: new ol.source.Vector({{ features: features }}) }})
  ],
  view: new ol.View({{
    center: features.length ? features[0].getGeometry().getCoordinates() : [0, 0],
    zoom: 16
  }})
}});
const popup = new ol.Overlay({{ element: document.getElementById("popup") }});
map.addOverlay(popup);
map.on("click", function (evt) {{
  const f = map.forEachFeatureAtPixel(evt.pixel, function (f) {{ return f; }});
  if (!f) {{ popup.setPosition(undefined); return; }}
  popup.getElement().innerHTML = "<b>" + f.get("address") + "</b><br><img width=\"320\" src=\"" + f.get("stream") + "\">";
  popup.setPosition(evt.coordinate);
}});
</script>
</body>
</html>
"#,
        css = MAP_CSS_CDN,
        js = MAP_JS_CDN,
        json = json,
    )
}
