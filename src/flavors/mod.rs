//! Kernel flavors: one installable Jupyter kernel per Backend.AI image.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flavor {
    /// Kernelspec directory name, also passed back to us via `-k`.
    pub name: &'static str,
    pub display_name: &'static str,
    pub language: &'static str,
    pub language_version: &'static str,
    pub mimetype: &'static str,
    pub file_extension: &'static str,
    pub codemirror_mode: Option<&'static str>,
    pub banner: &'static str,
    /// Image tag requested from the service.
    pub backend_lang: &'static str,
}

const FLAVORS: &[Flavor] = &[
    Flavor {
        name: "backendai-python",
        display_name: "Python 3 on Backend.AI",
        language: "python",
        language_version: "3",
        mimetype: "text/x-python3",
        file_extension: ".py",
        codemirror_mode: Some("python"),
        banner: "Backend.AI (Python 3)",
        backend_lang: "python:3.6",
    },
    Flavor {
        name: "backendai-python-torch",
        display_name: "PyTorch (Python 3, CPU) on Backend.AI",
        language: "python",
        language_version: "3",
        mimetype: "text/x-python3",
        file_extension: ".py",
        codemirror_mode: Some("python"),
        banner: "Backend.AI (PyTorch with Python 3)",
        backend_lang: "python-torch:0.2",
    },
    Flavor {
        name: "backendai-python-torch-gpu",
        display_name: "PyTorch (Python 3, GPU) on Backend.AI",
        language: "python",
        language_version: "3",
        mimetype: "text/x-python3",
        file_extension: ".py",
        codemirror_mode: Some("python"),
        banner: "Backend.AI (GPU-accelerated PyTorch with Python 3)",
        backend_lang: "python-torch:0.2-gpu",
    },
    Flavor {
        name: "backendai-python-tensorflow",
        display_name: "TensorFlow (Python 3, CPU) on Backend.AI",
        language: "python",
        language_version: "3",
        mimetype: "text/x-python3",
        file_extension: ".py",
        codemirror_mode: Some("python"),
        banner: "Backend.AI (TensorFlow with Python 3)",
        backend_lang: "python-tensorflow:1.8-py36",
    },
    Flavor {
        name: "backendai-python-tensorflow-gpu",
        display_name: "TensorFlow (Python 3, GPU) on Backend.AI",
        language: "python",
        language_version: "3",
        mimetype: "text/x-python3",
        file_extension: ".py",
        codemirror_mode: Some("python"),
        banner: "Backend.AI (GPU-accelerated TensorFlow with Python 3)",
        backend_lang: "python-tensorflow:1.8-gpu",
    },
    Flavor {
        name: "backendai-javascript",
        display_name: "Javascript (NodeJS 8) on Backend.AI",
        language: "javascript",
        language_version: "8",
        mimetype: "text/javascript",
        file_extension: ".js",
        codemirror_mode: Some("javascript"),
        banner: "Backend.AI (NodeJS 8)",
        backend_lang: "nodejs:8",
    },
    Flavor {
        name: "backendai-php",
        display_name: "PHP 7 on Backend.AI",
        language: "php",
        language_version: "7",
        mimetype: "text/x-php",
        file_extension: ".php",
        codemirror_mode: Some("php"),
        banner: "Backend.AI (PHP 7)",
        backend_lang: "php:7",
    },
    Flavor {
        name: "backendai-julia",
        display_name: "Julia 0.6 on Backend.AI",
        language: "julia",
        language_version: "0.6",
        mimetype: "text/x-julia",
        file_extension: ".jl",
        codemirror_mode: Some("julia"),
        banner: "Backend.AI (Julia 0.6)",
        backend_lang: "julia:0.6",
    },
    Flavor {
        name: "backendai-c",
        display_name: "C11 on Backend.AI",
        language: "c",
        language_version: "11",
        mimetype: "text/x-csrc",
        file_extension: ".c",
        codemirror_mode: Some("clike"),
        banner: "Backend.AI (C [gnu11])",
        backend_lang: "c:gcc6.3",
    },
    Flavor {
        name: "backendai-cpp",
        display_name: "C++14 on Backend.AI",
        language: "cpp",
        language_version: "14",
        mimetype: "text/x-c++src",
        file_extension: ".cc",
        codemirror_mode: Some("clike"),
        banner: "Backend.AI (C++ [gnu++14])",
        backend_lang: "cpp:gcc6.3",
    },
    Flavor {
        name: "backendai-java",
        display_name: "Java8 on Backend.AI",
        language: "java",
        language_version: "8",
        mimetype: "text/x-java",
        file_extension: ".java",
        codemirror_mode: Some("clike"),
        banner: "Backend.AI (Java [openjdk8])",
        backend_lang: "java:8",
    },
    Flavor {
        name: "backendai-r",
        display_name: "R 3 on Backend.AI",
        language: "r",
        language_version: "3",
        mimetype: "text/x-rsrc",
        file_extension: ".R",
        codemirror_mode: Some("Rscript"),
        banner: "Backend.AI (R 3)",
        backend_lang: "r:3",
    },
    Flavor {
        name: "backendai-lua",
        display_name: "Lua 5.3 on Backend.AI",
        language: "lua",
        language_version: "5.3",
        mimetype: "text/x-lua",
        file_extension: ".lua",
        codemirror_mode: Some("lua"),
        banner: "Backend.AI (Lua 5.3)",
        backend_lang: "lua:5.3",
    },
];

pub fn all() -> &'static [Flavor] {
    FLAVORS
}

pub fn find(name: &str) -> Option<&'static Flavor> {
    FLAVORS.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

impl Flavor {
    /// The `language_info` object of a `kernel_info_reply`. Jupyter shows
    /// `name` to the user, so it carries the display name.
    pub fn language_info(&self) -> Value {
        let mut info = json!({
            "name": self.display_name,
            "version": self.language_version,
            "mimetype": self.mimetype,
            "file_extension": self.file_extension,
        });
        if let Some(mode) = self.codemirror_mode {
            info["codemirror_mode"] = json!(mode);
        }
        info
    }
}
