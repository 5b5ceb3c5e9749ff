use std::path::Path;

/// Availability of analyzer skills at daemon start.
///
/// Missing required skills are a fatal preflight failure; missing optional
/// skills are recorded per job so nodes reflect the reduced context they
/// were produced with.
#[derive(Debug, Clone, Default)]
pub struct SkillProbe {
    pub available: Vec<String>,
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
}

impl SkillProbe {
    pub fn is_fatal(&self) -> bool {
        !self.missing_required.is_empty()
    }
}

/// A skill `name` is present as either `<skills_dir>/name.md` or
/// `<skills_dir>/name/SKILL.md`.
fn skill_exists(skills_dir: &Path, name: &str) -> bool {
    skills_dir.join(format!("{}.md", name)).is_file()
        || skills_dir.join(name).join("SKILL.md").is_file()
}

pub fn probe_skills(skills_dir: &Path, required: &[String], optional: &[String]) -> SkillProbe {
    let mut probe = SkillProbe::default();

    for name in required {
        if skill_exists(skills_dir, name) {
            probe.available.push(name.clone());
        } else {
            probe.missing_required.push(name.clone());
        }
    }
    for name in optional {
        if skill_exists(skills_dir, name) {
            probe.available.push(name.clone());
        } else {
            probe.missing_optional.push(name.clone());
        }
    }

    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_both_layouts() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("analysis.md"), "skill").unwrap();
        std::fs::create_dir_all(dir.path().join("lessons")).unwrap();
        std::fs::write(dir.path().join("lessons/SKILL.md"), "skill").unwrap();

        let probe = probe_skills(
            dir.path(),
            &["analysis".to_string(), "lessons".to_string()],
            &["friction".to_string()],
        );

        assert_eq!(probe.available, vec!["analysis", "lessons"]);
        assert!(probe.missing_required.is_empty());
        assert_eq!(probe.missing_optional, vec!["friction"]);
        assert!(!probe.is_fatal());
    }

    #[test]
    fn missing_required_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = probe_skills(dir.path(), &["analysis".to_string()], &[]);
        assert!(probe.is_fatal());
        assert_eq!(probe.missing_required, vec!["analysis"]);
    }
}
