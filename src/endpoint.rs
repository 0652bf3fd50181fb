/// Public Bedrock Runtime base URL for a region.
pub fn regional_base(region: &str) -> String {
    format!("https://bedrock-runtime.{}.amazonaws.com", region)
}

/// Invoke URL for `model_id` in `region`.
pub fn resolve_url(region: &str, model_id: &str, stream: bool) -> String {
    resolve_url_at(&regional_base(region), model_id, stream)
}

/// Invoke URL against an explicit base such as a VPC endpoint.
pub fn resolve_url_at(base: &str, model_id: &str, stream: bool) -> String {
    let action = if stream {
        "invoke-with-response-stream"
    } else {
        "invoke"
    };
    format!(
        "{}/model/{}/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(model_id),
        action
    )
}
