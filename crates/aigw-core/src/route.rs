//! Model name -> provider type resolution.

use std::collections::BTreeMap;

use aigw_provider_core::CredentialConfig;
use aigw_provider_impl::providers::warp::catalog_contains;

/// Display tag per provider family, used both for prefixing listed models
/// and for resolving an explicit brand prefix on inbound names.
fn family_tag(family: &str) -> String {
    match family {
        "openai" => "OpenAI".to_string(),
        "claude" => "Claude".to_string(),
        "gemini" => "Gemini".to_string(),
        "kiro" => "Kiro".to_string(),
        "qwen" => "Qwen".to_string(),
        "warp" => "Warp".to_string(),
        "orchids" => "Orchids".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

pub fn brand_tag(provider_type: &str) -> String {
    family_tag(provider_type.split('-').next().unwrap_or(provider_type))
}

/// Split a `[Brand] model` name into its parts.
pub fn strip_brand_prefix(raw: &str) -> (Option<String>, String) {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some((brand, model)) = rest.split_once(']')
    {
        let model = model.trim_start();
        if !brand.is_empty() && !model.is_empty() {
            return (Some(brand.to_string()), model.to_string());
        }
    }
    (None, trimmed.to_string())
}

/// Pick the provider type for a cleaned model name.
///
/// Precedence: explicit brand -> Warp's catalog -> Claude substrings ->
/// Gemini substrings -> Qwen -> OpenAI GPT/o-series -> the configured
/// default.  The order is fixed.
pub fn route_model(
    brand: Option<&str>,
    model: &str,
    pools: &BTreeMap<String, Vec<CredentialConfig>>,
    default_provider: &str,
) -> String {
    if let Some(brand) = brand {
        let wanted = brand.to_ascii_lowercase();
        // Exact provider type first, then family.
        if let Some(provider) = pools
            .keys()
            .find(|provider| provider.to_ascii_lowercase() == wanted)
        {
            return provider.clone();
        }
        if let Some(provider) = pools.keys().find(|provider| {
            provider
                .split('-')
                .next()
                .is_some_and(|family| family.eq_ignore_ascii_case(&wanted))
        }) {
            return provider.clone();
        }
    }

    let lowered = model.to_ascii_lowercase();
    let by_family = |family: &str| -> Option<String> {
        pools
            .keys()
            .find(|provider| provider.split('-').next() == Some(family))
            .cloned()
    };

    if catalog_contains(model)
        && let Some(provider) = by_family("warp")
    {
        return provider;
    }
    if lowered.contains("claude")
        && let Some(provider) = by_family("claude").or_else(|| by_family("kiro"))
    {
        return provider;
    }
    if lowered.contains("gemini")
        && let Some(provider) = by_family("gemini")
    {
        return provider;
    }
    if lowered.contains("qwen")
        && let Some(provider) = by_family("qwen")
    {
        return provider;
    }
    if (lowered.starts_with("gpt") || lowered.starts_with("o1") || lowered.starts_with("o3") || lowered.starts_with("o4"))
        && let Some(provider) = by_family("openai")
    {
        return provider;
    }
    default_provider.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools(providers: &[&str]) -> BTreeMap<String, Vec<CredentialConfig>> {
        providers
            .iter()
            .map(|provider| {
                (
                    provider.to_string(),
                    vec![CredentialConfig::new("cred")],
                )
            })
            .collect()
    }

    #[test]
    fn brand_prefix_strips_cleanly() {
        assert_eq!(
            strip_brand_prefix("[Warp] gpt-5"),
            (Some("Warp".to_string()), "gpt-5".to_string())
        );
        assert_eq!(strip_brand_prefix("gpt-5"), (None, "gpt-5".to_string()));
        assert_eq!(strip_brand_prefix("[] x"), (None, "[] x".to_string()));
    }

    #[test]
    fn brand_routes_to_matching_pool() {
        let pools = pools(&["kiro-oauth", "openai-custom"]);
        assert_eq!(
            route_model(Some("Kiro"), "claude-sonnet-4", &pools, "openai-custom"),
            "kiro-oauth"
        );
    }

    #[test]
    fn warp_catalog_outranks_substring_heuristics() {
        let pools = pools(&["warp", "claude-custom", "openai-custom"]);
        // claude-4-sonnet is in Warp's catalog, so Warp wins despite the
        // claude substring.
        assert_eq!(
            route_model(None, "claude-4-sonnet", &pools, "openai-custom"),
            "warp"
        );
        // Plain claude names still go to the claude pool.
        assert_eq!(
            route_model(None, "claude-sonnet-4-5", &pools, "openai-custom"),
            "claude-custom"
        );
    }

    #[test]
    fn kiro_serves_claude_models_when_no_claude_pool_exists() {
        let pools = pools(&["kiro-oauth", "openai-custom"]);
        assert_eq!(
            route_model(None, "claude-sonnet-4-5", &pools, "openai-custom"),
            "kiro-oauth"
        );
    }

    #[test]
    fn unmatched_models_fall_back_to_the_default() {
        let pools = pools(&["gemini-web"]);
        assert_eq!(
            route_model(None, "mistral-large", &pools, "openai-custom"),
            "openai-custom"
        );
    }
}
