//! Registry endpoints on the internal host.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::{client, internal_url, test_guid};

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_answer_version_check() {
        let response = client()
            .get(internal_url("/v2/"))
            .send()
            .await
            .expect("version check");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["docker-distribution-api-version"],
            "registry/2.0"
        );
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_store_and_fetch_manifest() {
        let client = client();
        let path = format!("/v2/org/{}/manifest/latest", test_guid("image"));
        let manifest = serde_json::json!({
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:0123",
                "size": 2
            },
            "layers": []
        });

        let response = client
            .put(internal_url(&path))
            .body(manifest.to_string())
            .send()
            .await
            .expect("put manifest");
        assert_eq!(response.status(), StatusCode::CREATED);
        let digest = response.headers()["docker-content-digest"].clone();

        let response = client.get(internal_url(&path)).send().await.expect("get");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["docker-content-digest"], digest);
        let fetched: serde_json::Value = response.json().await.expect("json");
        assert_eq!(fetched["schemaVersion"], 2);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_report_unknown_manifest() {
        let response = client()
            .get(internal_url("/v2/no/such/image/manifest/latest"))
            .send()
            .await
            .expect("get");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");
    }
}
