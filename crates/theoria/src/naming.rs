//! Host naming conventions. Derived from the conceptual type name so wrapped
//! and native types resolve the same table and key names.

pub fn snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (index, ch) in chars.iter().enumerate() {
        if ch.is_uppercase() {
            let prev_lower = index > 0
                && (chars[index - 1].is_lowercase() || chars[index - 1].is_ascii_digit());
            let next_lower = chars.get(index + 1).is_some_and(|next| next.is_lowercase());
            let prev_upper = index > 0 && chars[index - 1].is_uppercase();
            if index > 0 && (prev_lower || (prev_upper && next_lower)) && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else if *ch == ' ' || *ch == '-' {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(*ch);
        }
    }
    out
}

pub fn plural(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let lower = word.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|ch| !"aeiou".contains(ch)) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
    }
    if ["s", "x", "z", "ch", "sh"]
        .iter()
        .any(|suffix| lower.ends_with(suffix))
    {
        return format!("{word}es");
    }
    format!("{word}s")
}

/// Default table: plural snake case of the type name (`BlogPost` -> `blog_posts`).
pub fn table_name(type_name: &str) -> String {
    let snake = snake(type_name);
    match snake.rsplit_once('_') {
        Some((head, last)) => format!("{head}_{}", plural(last)),
        None => plural(&snake),
    }
}

/// Default foreign key pointing at `type_name` (`User` + `id` -> `user_id`).
pub fn foreign_key(type_name: &str, primary_key: &str) -> String {
    format!("{}_{primary_key}", snake(type_name))
}

/// Default link table for a many-to-many pair: both singular snake names sorted.
pub fn joining_table(left: &str, right: &str) -> String {
    let mut names = [snake(left), snake(right)];
    names.sort();
    names.join("_")
}

#[cfg(test)]
mod tests {
    use super::{foreign_key, joining_table, plural, snake, table_name};

    #[test]
    fn snake_cases_type_names() {
        assert_eq!(snake("User"), "user");
        assert_eq!(snake("BlogPost"), "blog_post");
        assert_eq!(snake("HTTPRequest"), "http_request");
        assert_eq!(snake("audit_log"), "audit_log");
    }

    #[test]
    fn pluralizes_common_endings() {
        assert_eq!(plural("user"), "users");
        assert_eq!(plural("country"), "countries");
        assert_eq!(plural("day"), "days");
        assert_eq!(plural("box"), "boxes");
        assert_eq!(plural("match"), "matches");
        assert_eq!(plural("taggable"), "taggables");
    }

    #[test]
    fn derives_tables_and_keys_from_conceptual_name() {
        assert_eq!(table_name("User"), "users");
        assert_eq!(table_name("AuditLog"), "audit_logs");
        assert_eq!(table_name("Country"), "countries");
        assert_eq!(foreign_key("User", "id"), "user_id");
        assert_eq!(foreign_key("AuditLog", "id"), "audit_log_id");
        assert_eq!(joining_table("User", "Role"), "role_user");
    }
}
