//! Server-rendered index page.

use askama::Template;
use axum::extract::State;
use axum::response::Html;

use crate::AppContext;

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexPage {
    pub config_error: Option<String>,
    pub node_name: String,
    pub node_ip: String,
    pub api_version: String,
}

fn render<T: Template>(tmpl: T) -> Html<String> {
    Html(tmpl.render().unwrap_or_else(|e| format!("<pre>Template error: {e}</pre>")))
}

/// GET /
pub async fn index(State(ctx): State<AppContext>) -> Html<String> {
    let st = ctx.backend.status();
    let identity = st.identity.unwrap_or_default();
    render(IndexPage {
        config_error: st.config_error,
        node_name: identity.control_plane_node_name.unwrap_or_default(),
        node_ip: identity.control_plane_node_ip.unwrap_or_default(),
        api_version: identity.api_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_shown() {
        let html = IndexPage {
            config_error: Some("no usable credential source".into()),
            node_name: String::new(),
            node_ip: String::new(),
            api_version: String::new(),
        }
        .render()
        .unwrap();
        assert!(html.contains("no usable credential source"));
    }

    #[test]
    fn identity_is_rendered() {
        let html = IndexPage {
            config_error: None,
            node_name: "cp-0".into(),
            node_ip: "10.0.0.1".into(),
            api_version: "v1.29.0".into(),
        }
        .render()
        .unwrap();
        assert!(html.contains("cp-0"));
        assert!(html.contains("v1.29.0"));
        assert!(!html.contains("configuration error"));
    }
}
