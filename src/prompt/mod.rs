use crate::{
    catalog::StyleCatalog,
    error::{AppError, AppResult},
    models::AssetType,
};

/// `"{prompt}, {asset type}, {style fragment}, game asset"`. The inference model was
/// tuned against this exact ordering.
pub fn enhance(
    catalog: &StyleCatalog,
    user_prompt: &str,
    asset_type: AssetType,
    style_preset: &str,
) -> AppResult<String> {
    let fragment = catalog.fragment(style_preset)?;
    Ok(format!("{user_prompt}, {asset_type}, {fragment}, game asset"))
}

/// Checks the user-supplied inputs, reporting every missing one at once.
pub fn validate_inputs(prompt: &str, token: &str) -> AppResult<()> {
    let mut missing = Vec::new();
    if token.trim().is_empty() {
        missing.push("api token");
    }
    if prompt.trim().is_empty() {
        missing.push("prompt");
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation { missing })
    }
}

pub fn tags_for(asset_type: AssetType, style_preset: &str) -> Vec<String> {
    vec![asset_type.to_string(), style_preset.to_string()]
}
