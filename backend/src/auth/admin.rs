/// Single-administrator authorization gate.
///
/// The configured email is normalized once; callers pass an already
/// resolved (trimmed, lower-cased) email.
#[derive(Debug, Clone)]
pub struct AdminGate {
    admin_email: String,
}

impl AdminGate {
    pub fn new(admin_email: &str) -> Self {
        Self {
            admin_email: admin_email.trim().to_lowercase(),
        }
    }

    /// True only for a non-empty email equal to the configured admin.
    /// An unset admin never matches, not even an empty identity.
    pub fn is_admin(&self, resolved_email: &str) -> bool {
        !self.admin_email.is_empty()
            && !resolved_email.is_empty()
            && resolved_email == self.admin_email
    }

    pub fn is_configured(&self) -> bool {
        !self.admin_email.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_admin_matches_normalized_config() {
        let gate = AdminGate::new("  Boss@Example.COM ");
        assert!(gate.is_admin("boss@example.com"));
        assert!(gate.is_configured());
    }

    #[rstest]
    #[case("other@example.com")]
    #[case("")]
    #[case("boss@example.com.evil")]
    fn test_non_admin(#[case] email: &str) {
        assert!(!AdminGate::new("boss@example.com").is_admin(email));
    }

    #[rstest]
    #[case("")]
    #[case("anyone@example.com")]
    fn test_unconfigured_gate_denies_everyone(#[case] email: &str) {
        let gate = AdminGate::new("   ");
        assert!(!gate.is_configured());
        assert!(!gate.is_admin(email));
    }
}
