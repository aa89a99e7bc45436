use chrono::{DateTime, Utc};
use contact_bus::ContactDetails;
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 150;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// STORED RECORD
// ============================================================================

/// A contact as held by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i32,
    pub name: String,
    pub area_code: String,
    pub phone_number: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Fields carried by Created/Updated events
    pub fn details(&self) -> ContactDetails {
        ContactDetails {
            name: self.name.clone(),
            area_code: self.area_code.clone(),
            phone_number: self.phone_number.clone(),
            email: self.email.clone(),
        }
    }

    fn matches(&self, search: &str) -> bool {
        let needle = search.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self.email.to_lowercase().contains(&needle)
            || self.area_code.contains(search)
            || self.phone_number.contains(search)
    }

    /// True when `search` is absent/blank or matches this contact
    pub fn matches_search(&self, search: Option<&str>) -> bool {
        match search.map(str::trim) {
            Some(s) if !s.is_empty() => self.matches(s),
            _ => true,
        }
    }
}

// ============================================================================
// INPUTS
// ============================================================================

/// Input for creating a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    pub area_code: String,
    pub phone_number: String,
    pub email: String,
}

impl NewContact {
    /// Copy with surrounding whitespace removed from every field
    pub fn trimmed(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            area_code: self.area_code.trim().to_string(),
            phone_number: self.phone_number.trim().to_string(),
            email: self.email.trim().to_string(),
        }
    }

    /// Every rule violation, empty when the input is valid
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("name is required".to_string());
        } else if self.name.chars().count() > MAX_NAME_LEN {
            errors.push(format!("name must be at most {} characters", MAX_NAME_LEN));
        }

        if !is_digits(&self.area_code, 2, 2) {
            errors.push("area code must be exactly 2 digits".to_string());
        }

        if !is_digits(&self.phone_number, 8, 9) {
            errors.push("phone number must be 8 or 9 digits".to_string());
        }

        if self.email.is_empty() {
            errors.push("email is required".to_string());
        } else if self.email.chars().count() > MAX_EMAIL_LEN {
            errors.push(format!("email must be at most {} characters", MAX_EMAIL_LEN));
        } else if !is_email(&self.email) {
            errors.push("email must be a valid address".to_string());
        }

        errors
    }
}

impl From<ContactDetails> for NewContact {
    fn from(details: ContactDetails) -> Self {
        Self {
            name: details.name,
            area_code: details.area_code,
            phone_number: details.phone_number,
            email: details.email,
        }
    }
}

/// Full replacement of a contact's editable fields
pub type ContactChanges = NewContact;

fn is_digits(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

// ============================================================================
// OUTPUTS
// ============================================================================

/// One page of a contact listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPage {
    pub items: Vec<Contact>,
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> NewContact {
        NewContact {
            name: "Ana".to_string(),
            area_code: "11".to_string(),
            phone_number: "987654321".to_string(),
            email: "a@x.com".to_string(),
        }
    }

    #[test]
    fn test_valid_input_has_no_violations() {
        assert!(valid().violations().is_empty());

        let eight_digits = NewContact {
            phone_number: "87654321".to_string(),
            ..valid()
        };
        assert!(eight_digits.violations().is_empty());
    }

    #[test]
    fn test_each_rule_is_reported() {
        let input = NewContact {
            name: "x".repeat(101),
            area_code: "1a".to_string(),
            phone_number: "1234567".to_string(),
            email: "no-at-sign".to_string(),
        };

        let errors = input.violations();
        assert_eq!(errors.len(), 4);
        assert!(errors[0].starts_with("name"));
        assert!(errors[1].starts_with("area code"));
        assert!(errors[2].starts_with("phone number"));
        assert!(errors[3].starts_with("email"));
    }

    #[test]
    fn test_email_shape() {
        assert!(is_email("ana.souza@example.com.br"));
        assert!(!is_email("@x.com"));
        assert!(!is_email("a@"));
        assert!(!is_email("a@@x.com"));
        assert!(!is_email("a b@x.com"));
    }

    #[test]
    fn test_name_limit_counts_characters() {
        let input = NewContact {
            name: "é".repeat(100),
            ..valid()
        };
        assert!(input.violations().is_empty());
    }

    #[test]
    fn test_search_matching() {
        let contact = Contact {
            id: 1,
            name: "Ana Souza".to_string(),
            area_code: "11".to_string(),
            phone_number: "987654321".to_string(),
            email: "Ana@X.com".to_string(),
            created_at: Utc::now(),
            updated_at: None,
        };

        assert!(contact.matches_search(None));
        assert!(contact.matches_search(Some("  ")));
        assert!(contact.matches_search(Some("souza")));
        assert!(contact.matches_search(Some("ana@x")));
        assert!(contact.matches_search(Some("8765")));
        assert!(!contact.matches_search(Some("bia")));
    }

    #[test]
    fn test_contact_serializes_camel_case() {
        let contact = Contact {
            id: 1,
            name: "Ana".to_string(),
            area_code: "11".to_string(),
            phone_number: "987654321".to_string(),
            email: "a@x.com".to_string(),
            created_at: Utc::now(),
            updated_at: None,
        };

        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["areaCode"], "11");
        assert_eq!(json["phoneNumber"], "987654321");
        assert!(json.get("updatedAt").is_none());
    }
}
