use serde::{Deserialize, Serialize};

/// Serves the health-check endpoint on the internal route prefix.
#[derive(Debug, Clone)]
pub struct Handler {
    pub app_revision: String,
    pub deploy_id: String,
}

impl Handler {
    pub fn respond(&self) -> axum::response::Response {
        let payload = Response {
            code: "ok".into(),
            message: "Your Encore app is up and running!".into(),
            details: Details {
                app_revision: self.app_revision.clone(),
                encore_compiler: crate::version().into(),
                deploy_id: self.deploy_id.clone(),
            },
        };

        let body = serde_json::to_vec(&payload).expect("serialize healthz response");
        axum::http::Response::builder()
            .status(200)
            .header(
                axum::http::header::CONTENT_TYPE,
                mime::APPLICATION_JSON.as_ref(),
            )
            .body(axum::body::Body::from(body))
            .unwrap()
    }
}

#[derive(Serialize, Deserialize)]
pub struct Response {
    pub code: String,
    pub message: String,
    pub details: Details,
}

#[derive(Serialize, Deserialize)]
pub struct Details {
    pub app_revision: String,
    pub encore_compiler: String,
    pub deploy_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn healthz_shape() {
        let handler = Handler {
            app_revision: "abc123".into(),
            deploy_id: "deploy-1".into(),
        };
        let resp = handler.respond();
        assert_eq!(resp.status(), 200);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.code, "ok");
        assert_eq!(parsed.details.app_revision, "abc123");
        assert_eq!(parsed.details.deploy_id, "deploy-1");
    }
}
