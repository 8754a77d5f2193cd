//! Upload, download and delete through the internal host.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::{client, internal_url, test_guid, with_form_file, zip_with};

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_upload_and_download_package() {
        let client = client();
        let path = format!("/packages/{}", test_guid("pkg"));
        let package = zip_with("somefile", b"lalala\n\n");

        let response = with_form_file(client.put(internal_url(&path)), "package", &package)
            .send()
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = client.get(internal_url(&path)).send().await.expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.bytes().await.expect("body");
        assert_eq!(body.as_ref(), package.as_slice());
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_delete_droplet() {
        let client = client();
        let path = format!("/droplets/{}", test_guid("drop"));

        let response = with_form_file(client.put(internal_url(&path)), "droplet", b"bits")
            .send()
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = client.delete(internal_url(&path)).send().await.expect("delete");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client.get(internal_url(&path)).send().await.expect("get");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: serde_json::Value = response.json().await.expect("error body");
        assert_eq!(error["code"], "NotFound");
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_accept_async_upload() {
        let client = client();
        let path = format!("/buildpacks/{}", test_guid("bp"));
        let buildpack = zip_with("bin/detect", b"#!/bin/sh\nexit 0\n");

        let response = with_form_file(
            client.put(internal_url(&format!("{path}?async=true"))),
            "buildpack",
            &buildpack,
        )
        .send()
        .await
        .expect("upload");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut status = StatusCode::NOT_FOUND;
        for _ in 0..100 {
            status = client
                .get(internal_url(&path))
                .send()
                .await
                .expect("poll")
                .status();
            if status == StatusCode::OK {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_answer_health_check() {
        let response = client()
            .get(internal_url("/_health"))
            .send()
            .await
            .expect("health");
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["status"], "running");
    }
}
