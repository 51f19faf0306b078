//! Visibility checker for Limit
//!
//! Two regimes, never mixed:
//!
//! - Module scope: a module is a single source file; its top-level
//!   members are private by default, `protected`, or `pub`. Access from
//!   the same module is always allowed. Across modules, only public
//!   members are visible (`protected` is reserved for future package
//!   semantics and currently behaves as public within a project tree).
//! - Class members: private is visible only inside the declaring class
//!   (regardless of module), protected in the declaring class and its
//!   subclasses (even across modules), public anywhere.
//!
//! The type checker records every access site with its declaration-time
//! context; this pass validates those records against the registries.
//! The error messages keep the regimes apart: "private class member"
//! is never reported as "non-public module member" or vice versa.

use crate::ast::Visibility;
use crate::codes;
use crate::modules::ModuleRegistry;
use crate::typecheck::{ClassAccess, ModuleAccess, TypeCheckResults};
use crate::types::TypeTable;
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Stage};

pub struct VisibilityChecker<'a> {
    types: &'a TypeTable,
    modules: &'a ModuleRegistry,
    sink: &'a mut DiagnosticSink,
}

impl<'a> VisibilityChecker<'a> {
    pub fn new(
        types: &'a TypeTable,
        modules: &'a ModuleRegistry,
        sink: &'a mut DiagnosticSink,
    ) -> Self {
        VisibilityChecker {
            types,
            modules,
            sink,
        }
    }

    pub fn check(&mut self, results: &TypeCheckResults) {
        for access in &results.module_accesses {
            self.check_module_access(access);
        }
        for access in &results.class_accesses {
            self.check_class_access(access);
        }
    }

    fn check_module_access(&mut self, access: &ModuleAccess) {
        // Same module: always allowed, whatever the modifier says
        if access.from_module == access.module {
            return;
        }
        let Some(binding) = self.modules.binding(&access.module, &access.name) else {
            return; // undefined-name already reported by the type checker
        };
        match binding.vis {
            Visibility::Public => {}
            // Reserved for package semantics; behaves as public within
            // a project tree for now
            Visibility::Protected => {}
            Visibility::Private => {
                self.sink.push(
                    Diagnostic::error(
                        codes::NON_PUBLIC_MODULE_MEMBER,
                        Stage::Visibility,
                        format!(
                            "'{}' is a private member of module '{}'",
                            access.name, access.module
                        ),
                    )
                    .at(access.file, access.span)
                    .with_suggestion(format!(
                        "mark it 'pub' in {} to export it",
                        access.module
                    )),
                );
            }
        }
    }

    fn check_class_access(&mut self, access: &ClassAccess) {
        let Some((member, declaring)) = self.types.find_member(access.class, &access.member)
        else {
            return; // bad-field already reported by the type checker
        };
        match member.vis {
            Visibility::Public => {}
            Visibility::Private => {
                // Only the declaring class itself, regardless of module
                let allowed = access.from_class == Some(declaring);
                if !allowed {
                    let class_name = &self.types.class(declaring).name;
                    self.sink.push(
                        Diagnostic::error(
                            codes::PRIVATE_CLASS_MEMBER,
                            Stage::Visibility,
                            format!(
                                "'{}' is a private class member of '{}'",
                                access.member, class_name
                            ),
                        )
                        .at(access.file, access.span)
                        .with_hint("private members are visible only inside the declaring class"),
                    );
                }
            }
            Visibility::Protected => {
                // Declaring class and subclasses, even across modules
                let allowed = access
                    .from_class
                    .is_some_and(|from| self.types.is_subclass(from, declaring));
                if !allowed {
                    let class_name = &self.types.class(declaring).name;
                    self.sink.push(
                        Diagnostic::error(
                            codes::PROTECTED_CLASS_MEMBER,
                            Stage::Visibility,
                            format!(
                                "'{}' is a protected class member of '{}'",
                                access.member, class_name
                            ),
                        )
                        .at(access.file, access.span)
                        .with_hint(
                            "protected members are visible in the declaring class and its subclasses",
                        ),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleRegistry;
    use crate::options::CompilerOptions;
    use crate::parser;
    use crate::scanner::{self, ScanMode};
    use crate::typecheck::TypeChecker;
    use crate::types::TypeTable;
    use limit_core::source::FileId;

    /// Compile a set of modules and run visibility checking
    fn run(sources: &[(&str, &str)]) -> DiagnosticSink {
        let mut sink = DiagnosticSink::new();
        let options = CompilerOptions::default();
        let mut types = TypeTable::new();
        let mut modules = ModuleRegistry::new();

        let parsed: Vec<_> = sources
            .iter()
            .enumerate()
            .map(|(index, (name, source))| {
                let file = FileId(index as u32);
                let tokens = scanner::scan(source, file, ScanMode::Legacy, &mut sink);
                parser::parse(tokens, file, name, ScanMode::Legacy, &mut sink).module
            })
            .collect();
        assert!(!sink.has_errors(), "parse errors: {:?}", sink.iter().collect::<Vec<_>>());

        let mut checker = TypeChecker::new(&mut types, &mut modules, &mut sink, &options);
        for module in &parsed {
            checker.declare_module(module);
        }
        for module in &parsed {
            checker.check_module(module);
        }
        let results = checker.into_results();

        let mut visibility = VisibilityChecker::new(&types, &modules, &mut sink);
        visibility.check(&results);
        sink
    }

    const M1: &str = r#"
pub class K {
    pub fn hi(): str { return "hi"; }
    fn secret_method(): str { return "no"; }
}
var secret: int = 1;
pub var open: int = 2;
"#;

    #[test]
    fn test_public_class_member_across_modules() {
        let sink = run(&[
            ("m1", M1),
            ("main", "import m1;\nprint(m1.K().hi());\n"),
        ]);
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_private_module_member_rejected() {
        let sink = run(&[("m1", M1), ("main", "import m1;\nprint(m1.secret);\n")]);
        assert!(sink
            .iter()
            .any(|d| d.code == codes::NON_PUBLIC_MODULE_MEMBER));
    }

    #[test]
    fn test_public_module_member_allowed() {
        let sink = run(&[("m1", M1), ("main", "import m1;\nprint(m1.open);\n")]);
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_private_class_member_rejected_with_class_wording() {
        let sink = run(&[
            ("m1", M1),
            ("main", "import m1;\nprint(m1.K().secret_method());\n"),
        ]);
        let diag = sink
            .iter()
            .find(|d| d.code == codes::PRIVATE_CLASS_MEMBER)
            .expect("expected a private-class-member error");
        assert!(diag.message.contains("private class member"));
    }

    #[test]
    fn test_same_module_private_always_allowed() {
        let sink = run(&[(
            "main",
            "var secret: int = 1;\nprint(secret);\n",
        )]);
        assert!(!sink.has_errors());
    }

    #[test]
    fn test_protected_class_member_from_subclass() {
        let sink = run(&[(
            "main",
            r#"
class A {
    protected fn helper(): int { return 1; }
    pub fn base(): int { return 0; }
}
class B : A {
    pub fn use_helper(): int { return self.helper(); }
}
"#,
        )]);
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_protected_class_member_from_outside_rejected() {
        let sink = run(&[(
            "main",
            r#"
class A {
    protected fn helper(): int { return 1; }
}
var a: A = A();
print(a.helper());
"#,
        )]);
        assert!(sink
            .iter()
            .any(|d| d.code == codes::PROTECTED_CLASS_MEMBER));
    }

    #[test]
    fn test_regimes_are_independent() {
        // Making the class member public does not leak the private
        // module binding, and vice versa
        let sink = run(&[
            ("m1", M1),
            (
                "main",
                "import m1;\nprint(m1.K().hi());\nprint(m1.secret);\n",
            ),
        ]);
        // Class access clean, module access rejected
        assert!(!sink.iter().any(|d| d.code == codes::PRIVATE_CLASS_MEMBER));
        assert!(sink
            .iter()
            .any(|d| d.code == codes::NON_PUBLIC_MODULE_MEMBER));
    }

    #[test]
    fn test_protected_module_member_behaves_public() {
        let sink = run(&[
            ("m1", "protected var shared: int = 3;\n"),
            ("main", "import m1;\nprint(m1.shared);\n"),
        ]);
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
    }
}
