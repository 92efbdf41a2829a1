//! Trust anchors compiled into the binary.

use crate::domain::TrustRootId;

const DEV_ROOT: &[u8] = include_bytes!("roots/dev.json");
const STAGING_ROOT: &[u8] = include_bytes!("roots/staging.json");
const PROD_ROOT: &[u8] = include_bytes!("roots/prod.json");

/// Initial root metadata for a trust root
pub fn embedded_root(id: TrustRootId) -> &'static [u8] {
    match id {
        TrustRootId::Dev => DEV_ROOT,
        TrustRootId::Staging => STAGING_ROOT,
        TrustRootId::Prod => PROD_ROOT,
    }
}
