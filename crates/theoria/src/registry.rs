use std::sync::Arc;

use indexmap::IndexMap;

use crate::relation::RelationDecl;
use crate::{Family, ModelBuilder, ModelDef, TheoriaError, TheoriaResult};

/// Sealed model metadata by type name, plus the morph map used by polymorphic
/// relations. Relation targets and families are resolved once, at build.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    defs: Arc<IndexMap<String, Arc<ModelDef>>>,
    morph_map: Arc<IndexMap<String, String>>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    models: Vec<ModelBuilder>,
}

impl RegistryBuilder {
    pub fn model(mut self, model: ModelBuilder) -> Self {
        self.models.push(model);
        self
    }

    pub fn build(self) -> TheoriaResult<Registry> {
        let mut sealed: IndexMap<String, (ModelDef, Vec<(String, RelationDecl)>)> =
            IndexMap::new();
        for model in self.models {
            let name = model.name().to_string();
            if sealed.contains_key(&name) {
                return Err(TheoriaError::configuration(format!(
                    "model [{name}] is registered twice"
                )));
            }
            sealed.insert(name, model.seal());
        }

        let mut morph_map = IndexMap::new();
        for (name, (def, _)) in &sealed {
            if let Some(existing) = morph_map.insert(def.morph_class().to_string(), name.clone()) {
                return Err(TheoriaError::configuration(format!(
                    "morph class [{}] is used by both [{existing}] and [{name}]",
                    def.morph_class()
                )));
            }
        }

        let mut resolved = Vec::with_capacity(sealed.len());
        for (def, decls) in sealed.values() {
            let mut relations = IndexMap::with_capacity(decls.len());
            for (relation_name, decl) in decls {
                let lookup = |name: &str| {
                    sealed.get(name).map(|(def, _)| def).ok_or_else(|| {
                        TheoriaError::configuration(format!(
                            "relation [{relation_name}] on [{}] refers to unknown model [{name}]",
                            def.name()
                        ))
                    })
                };
                let target = decl.target().map(lookup).transpose()?;
                let through = decl.through().map(lookup).transpose()?;
                let relation = decl.clone().resolve(relation_name, def, target, through)?;
                relations.insert(relation_name.clone(), relation);
            }
            resolved.push(relations);
        }

        let mut defs = IndexMap::with_capacity(sealed.len());
        for ((name, (mut def, _)), relations) in sealed.into_iter().zip(resolved) {
            def.relations = relations;
            log::trace!(
                "registered {name} ({:?}) with {} relation(s)",
                def.family(),
                def.relations.len()
            );
            defs.insert(name, Arc::new(def));
        }
        Ok(Registry {
            defs: Arc::new(defs),
            morph_map: Arc::new(morph_map),
        })
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn def(&self, name: &str) -> TheoriaResult<Arc<ModelDef>> {
        self.defs
            .get(name)
            .cloned()
            .ok_or_else(|| TheoriaError::configuration(format!("model [{name}] is not registered")))
    }

    /// Type registered under a morph class (the value stored in `*_type` columns).
    pub fn morph_def(&self, class: &str) -> TheoriaResult<Arc<ModelDef>> {
        let name = self.morph_map.get(class).ok_or_else(|| {
            TheoriaError::configuration(format!("no model is registered for morph class [{class}]"))
        })?;
        self.def(name)
    }

    pub fn family_of(&self, name: &str) -> TheoriaResult<Family> {
        Ok(self.def(name)?.family())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::{Family, ModelBuilder, RelationDecl};

    #[test]
    fn morph_aliases_resolve_to_types() {
        let registry = Registry::builder()
            .model(ModelBuilder::read_only("Post").morph_alias("post"))
            .model(ModelBuilder::native("AuditLog"))
            .build()
            .expect("registry");
        assert_eq!(registry.morph_def("post").expect("post").name(), "Post");
        assert_eq!(registry.family_of("AuditLog").expect("family"), Family::Native);
        assert!(registry.morph_def("Post").expect_err("alias only").is_configuration());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Post", "AuditLog"]);
    }

    #[test]
    fn unknown_targets_and_duplicates_are_configuration_errors() {
        let err = Registry::builder()
            .model(
                ModelBuilder::read_only("Post")
                    .relation("author", RelationDecl::belongs_to("Ghost")),
            )
            .build()
            .expect_err("unknown target");
        assert!(err.is_configuration(), "{err}");

        let err = Registry::builder()
            .model(ModelBuilder::read_only("Post"))
            .model(ModelBuilder::read_only("Post"))
            .build()
            .expect_err("duplicate");
        assert!(err.is_configuration());

        let err = Registry::builder()
            .model(ModelBuilder::read_only("Post").morph_alias("entry"))
            .model(ModelBuilder::read_only("Page").morph_alias("entry"))
            .build()
            .expect_err("morph clash");
        assert!(err.is_configuration());
        assert!(Registry::default().def("Post").is_err());
    }
}
