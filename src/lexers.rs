use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};

/// Source highlighter names with a differently named SyntaxHighlight equivalent
const MAPPED_LEXERS: &[(&str, &str)] = &[
    ("as", "actionscript"),
    ("as3", "actionscript3"),
    ("aug", "augeas"),
    ("batchfile", "bat"),
    ("terminal", "console"),
    ("shell_session", "shell-session"),
    ("dlang", "d"),
    ("patch", "diff"),
    ("containerfile", "dockerfile"),
    ("Containerfile", "Dockerfile"),
    ("e-mail", "email"),
    ("eruby", "erb"),
    ("ff", "freefem"),
    ("behat", "gherkin"),
    ("nextflow", "groovy"),
    ("nf", "groovy"),
    ("HAML", "haml"),
    ("hbs", "handlebars"),
    ("mustache", "handlebars"),
    ("pry", "irb"),
    ("isa", "isabelle"),
    ("Isabelle", "isabelle"),
    ("literate_haskell", "literate-haskell"),
    ("lithaskell", "literate-haskell"),
    ("ls", "livescript"),
    ("gnumake", "make"),
    ("mkd", "markdown"),
    ("wl", "mathematica"),
    ("wolfram", "mathematica"),
    ("m", "matlab"),
    ("objective_c", "objective-c"),
    ("obj_c", "obj-c"),
    ("objective_cpp", "objective-c++"),
    ("objcpp", "objc++"),
    ("obj-cpp", "objc++"),
    ("obj_cpp", "objc++"),
    ("objectivecpp", "objective-c++"),
    ("obj-c++", "objc++"),
    ("obj_c++", "objc++"),
    ("objectivec++", "objective-c++"),
    ("plaintext", "text"),
    ("plist", "text"),
    ("ps", "postscript"),
    ("eps", "postscript"),
    ("microsoftshell", "powershell"),
    ("msshell", "powershell"),
    ("pp", "puppet"),
    ("robot_framework", "robotframework"),
    ("robot", "robotframework"),
    ("robot-framework", "robotframework"),
    ("ml", "sml"),
    ("TeX", "tex"),
    ("LaTeX", "latex"),
    ("visualbasic", "vb"),
    ("varnishconf", "vcl"),
    ("varnish", "vcl"),
    ("viml", "vim"),
    ("vimscript", "vim"),
    ("zir", "zig"),
];

/// Source highlighter names SyntaxHighlight cannot render
const UNSUPPORTED_LEXERS: &[&str] = &[
    "apex", "apiblueprint", "apib", "armasm", "biml", "bpf", "brightscript", "bs", "brs",
    "bsl", "cfscript", "cisco_ios", "cmhg", "codeowners", "conf", "config", "configuration",
    "csvs", "dafny", "datastudio", "digdag", "elm", "eex", "leex", "heex", "epp", "escape",
    "esc", "fluent", "ftl", "ghc-cmm", "cmm", "ghc-core", "gradle", "graphql", "hack", "hh",
    "hcl", "hocon", "hql", "idlang", "iecst", "isbl", "janet", "jdn", "jsl", "json-doc",
    "jsonc", "json5", "jsonnet", "jsx", "react", "literate_coffeescript", "litcoffee",
    "lustre", "lutin", "m68k", "magik", "minizinc", "mojo", "msgtrans", "nesasm", "nes",
    "nial", "ocl", "OCL", "opentype_feature_file", "fea", "opentype", "opentypefeature", "p4",
    "plsql", "prometheus", "q", "kdb+", "rego", "rescript", "rml", "slice", "sqf", "ssh",
    "svelte", "systemd", "unit-file", "syzlang", "syzprog", "tsx", "ttcn3", "tulip", "vue",
    "vuejs", "wollok", "xojo", "realbasic", "xpath",
];

pub const PLAIN_TEXT_LEXER: &str = "text";

static MAPPED: Lazy<FxHashMap<&'static str, &'static str>> =
    Lazy::new(|| MAPPED_LEXERS.iter().copied().collect());

static UNSUPPORTED: Lazy<FxHashSet<&'static str>> =
    Lazy::new(|| UNSUPPORTED_LEXERS.iter().copied().collect());

/// Translates a code block's class or `lang` value to a lexer name.
///
/// Whitespace and the `language-` / `syntaxhl` decorations are stripped first.
/// Unsupported and empty names fall back to [`PLAIN_TEXT_LEXER`].
pub fn convert_lexer_name(raw: &str) -> String {
    let name: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let name = name.replace("language-", "").replace("syntaxhl", "");

    if let Some(mapped) = MAPPED.get(name.as_str()) {
        return (*mapped).to_string();
    }
    if name.is_empty() || UNSUPPORTED.contains(name.as_str()) {
        return PLAIN_TEXT_LEXER.to_string();
    }
    name
}
