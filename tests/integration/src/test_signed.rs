//! Signed URL flows through the public host.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::{
        PUBLIC_HOST, client, internal_url, public_url, sign, test_guid, with_form_file, zip_with,
    };

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_forbid_unsigned_public_download() {
        let response = client()
            .get(public_url("/packages/whatever"))
            .send()
            .await
            .expect("get");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_require_credentials_to_sign() {
        let response = client()
            .get(internal_url("/sign/packages/whatever"))
            .send()
            .await
            .expect("sign");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("www-authenticate"));
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_upload_and_download_through_signed_urls() {
        let client = client();
        let guid = test_guid("signed");
        let package = zip_with("somefile", b"lalala\n\n");

        let put_url = sign(&client, &format!("/sign/packages/{guid}?verb=put"))
            .await
            .expect("sign put");
        assert!(put_url.contains(PUBLIC_HOST), "{put_url}");
        let response = with_form_file(client.put(format!("{put_url}&async=true")), "package", &package)
            .send()
            .await
            .expect("signed upload");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let get_url = sign(&client, &format!("/sign/packages/{guid}"))
            .await
            .expect("sign get");
        let mut response = client.get(&get_url).send().await.expect("signed download");
        for _ in 0..100 {
            if response.status() == StatusCode::OK {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            response = client.get(&get_url).send().await.expect("signed download");
        }
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.bytes().await.expect("body");
        assert_eq!(body.as_ref(), package.as_slice());

        // A read URL cannot be used to write.
        let response = with_form_file(client.put(&get_url), "package", b"overwrite")
            .send()
            .await
            .expect("put with read url");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_reject_tampered_expiry() {
        let client = client();
        let url = sign(&client, "/sign/packages/tampered").await.expect("sign");
        let tampered = url.replacen("expires=", "expires=9", 1);
        let response = client.get(&tampered).send().await.expect("get");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
