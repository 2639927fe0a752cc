mod external_secret;

pub use external_secret::*;
