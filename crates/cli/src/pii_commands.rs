use std::io::Read;

use {
    keyward_config::KeywardConfig,
    keyward_keys::{MaskType, hash_identifier, mask_for_display},
    zeroize::Zeroizing,
};

/// The positional value, or stdin without its trailing newline.
fn value_or_stdin(value: Option<String>) -> anyhow::Result<Zeroizing<String>> {
    if let Some(value) = value {
        return Ok(Zeroizing::new(value));
    }
    let mut buf = Zeroizing::new(String::new());
    std::io::stdin().read_to_string(&mut buf)?;
    let trimmed = buf.trim_end_matches(['\r', '\n']).len();
    buf.truncate(trimmed);
    Ok(buf)
}

pub fn hash(config: &KeywardConfig, value: Option<String>, salt_var: Option<&str>) -> anyhow::Result<()> {
    let var = salt_var.unwrap_or(&config.pii.hash_salt_var);
    let salt = Zeroizing::new(
        std::env::var(var).map_err(|_| anyhow::anyhow!("environment variable {var} is not set"))?,
    );
    let value = value_or_stdin(value)?;
    println!("{}", hash_identifier(&value, salt.as_bytes())?);
    Ok(())
}

pub fn mask(value: Option<String>, mask_type: MaskType) -> anyhow::Result<()> {
    let value = value_or_stdin(value)?;
    println!("{}", mask_for_display(&value, mask_type));
    Ok(())
}
